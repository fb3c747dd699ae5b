//! # IPC Core Types
//!
//! Shared vocabulary for the client and server transports.
//!
//! ## Philosophy
//!
//! - **Stable codes, not strings**: result codes are part of the wire
//!   contract and are never renumbered
//! - **Typed envelopes**: frame metadata has an explicit schema; message
//!   bodies stay opaque bytes
//! - **Traceable**: every request carries a correlation ID so a response
//!   can never be matched to the wrong call

pub mod error;
pub mod frame;
pub mod handshake;
pub mod ids;

pub use error::{to_library_error, ErrorKind};
pub use frame::{FlowControlState, Frame, FrameError, FrameKind, MAX_FRAME_BODY};
pub use handshake::{
    ChannelSizing, ConnectRequest, ConnectResponse, ConnectResult, HANDSHAKE_SCHEMA_VERSION,
    MAX_ENDPOINT_NAME, MAX_MESSAGE_SIZE, MIN_MESSAGE_SIZE,
};
pub use ids::{ConnectionId, CorrelationId, MessageId, SchemaVersion, ServiceId};
