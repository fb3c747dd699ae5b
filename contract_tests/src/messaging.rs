//! Request/response contract
//!
//! One response per request, status codes intact across the wire,
//! negotiated size limits enforced on both directions, zero-copy
//! buffers accounted exactly.
