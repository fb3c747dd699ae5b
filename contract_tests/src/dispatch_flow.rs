//! Dispatch delivery and flow-control contract
//!
//! Events arrive in enqueue order, independent of the request stream.
//! The server flips flow control on as its ring approaches capacity and
//! off again once the client drains it; a client that has seen the
//! enabled state fails sends fast instead of blocking.
