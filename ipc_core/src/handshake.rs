//! Connection setup: service selection and channel sizing negotiation.
//!
//! The handshake happens once per connection, before any frames flow.
//! Both sides exchange one versioned serde_json blob behind the same
//! length-prefix discipline the frames use.

use crate::error::ErrorKind;
use crate::ids::{SchemaVersion, ServiceId};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::io::{Read, Write};
use thiserror::Error;

/// Handshake schema version (v1.0).
pub const HANDSHAKE_SCHEMA_VERSION: SchemaVersion = SchemaVersion::new(1, 0);

/// Smallest accepted per-message channel size.
pub const MIN_MESSAGE_SIZE: usize = 64;

/// Largest accepted per-message channel size.
pub const MAX_MESSAGE_SIZE: usize = crate::frame::MAX_FRAME_BODY;

/// Longest accepted endpoint name (`sun_path` minus the terminator).
pub const MAX_ENDPOINT_NAME: usize = 107;

/// Smallest dispatch ring slot count (two slots of real capacity).
pub const MIN_DISPATCH_SLOTS: usize = 4;

/// Largest dispatch ring slot count.
pub const MAX_DISPATCH_SLOTS: usize = 4096;

const MAX_HANDSHAKE_BLOB: usize = 64 * 1024;

/// Per-connection channel sizing requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSizing {
    /// Largest request body the client will send
    pub request_size: usize,
    /// Largest response body the client can receive
    pub response_size: usize,
    /// Largest dispatch event body
    pub dispatch_size: usize,
    /// Dispatch ring slot count (two slots are bookkeeping headroom)
    pub dispatch_slots: usize,
}

impl ChannelSizing {
    /// Checks every field against the protocol bounds.
    pub fn validate(&self) -> Result<(), ErrorKind> {
        for size in [self.request_size, self.response_size, self.dispatch_size] {
            if size < MIN_MESSAGE_SIZE {
                return Err(ErrorKind::InvalidParam);
            }
            if size > MAX_MESSAGE_SIZE {
                return Err(ErrorKind::TooBig);
            }
        }
        if self.dispatch_slots < MIN_DISPATCH_SLOTS || self.dispatch_slots > MAX_DISPATCH_SLOTS {
            return Err(ErrorKind::InvalidParam);
        }
        Ok(())
    }
}

impl Default for ChannelSizing {
    fn default() -> Self {
        Self {
            request_size: 8 * 1024,
            response_size: 8 * 1024,
            dispatch_size: 8 * 1024,
            dispatch_slots: 34,
        }
    }
}

/// First blob on the wire, client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    /// Handshake schema version
    pub version: SchemaVersion,
    /// Service whose handler table this connection selects
    pub service: ServiceId,
    /// Requested channel sizing
    pub sizing: ChannelSizing,
}

impl ConnectRequest {
    /// Creates a handshake request using the current schema version.
    pub fn new(service: ServiceId, sizing: ChannelSizing) -> Self {
        Self {
            version: HANDSHAKE_SCHEMA_VERSION,
            service,
            sizing,
        }
    }
}

/// Outcome of the service-selection handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectResult {
    /// Connection accepted with the (possibly adjusted) sizing
    Accepted { sizing: ChannelSizing },
    /// Connection rejected; `status` is an [`ErrorKind`] code
    Rejected { status: i32 },
}

/// Second blob on the wire, server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectResponse {
    /// Handshake schema version
    pub version: SchemaVersion,
    /// Accept or reject decision
    pub result: ConnectResult,
}

impl ConnectResponse {
    /// Creates an accepting response.
    pub fn accepted(sizing: ChannelSizing) -> Self {
        Self {
            version: HANDSHAKE_SCHEMA_VERSION,
            result: ConnectResult::Accepted { sizing },
        }
    }

    /// Creates a rejecting response carrying a result code.
    pub fn rejected(status: ErrorKind) -> Self {
        Self {
            version: HANDSHAKE_SCHEMA_VERSION,
            result: ConnectResult::Rejected {
                status: status.code(),
            },
        }
    }
}

/// Errors while exchanging handshake blobs.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Handshake blob exceeds size bound ({0} bytes)")]
    TooLarge(usize),
}

impl HandshakeError {
    /// Collapses the error into a library result code.
    pub fn to_error_kind(&self) -> ErrorKind {
        match self {
            HandshakeError::Io(err) => crate::error::io_to_library_error(err),
            HandshakeError::Codec(_) => ErrorKind::MessageError,
            HandshakeError::TooLarge(_) => ErrorKind::TooBig,
        }
    }
}

/// Writes one length-prefixed handshake blob.
pub fn write_handshake<W: Write, T: Serialize>(
    writer: &mut W,
    blob: &T,
) -> Result<(), HandshakeError> {
    let encoded = serde_json::to_vec(blob)?;
    if encoded.len() > MAX_HANDSHAKE_BLOB {
        return Err(HandshakeError::TooLarge(encoded.len()));
    }
    writer.write_all(&(encoded.len() as u32).to_le_bytes())?;
    writer.write_all(&encoded)?;
    writer.flush()?;
    Ok(())
}

/// Reads one length-prefixed handshake blob.
pub fn read_handshake<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T, HandshakeError> {
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix)?;
    let len = u32::from_le_bytes(prefix) as usize;
    if len > MAX_HANDSHAKE_BLOB {
        return Err(HandshakeError::TooLarge(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(serde_json::from_slice(&buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_roundtrip() {
        let request = ConnectRequest::new(ServiceId::new(2), ChannelSizing::default());
        let mut wire = Vec::new();
        write_handshake(&mut wire, &request).unwrap();

        let decoded: ConnectRequest = read_handshake(&mut wire.as_slice()).unwrap();
        assert_eq!(decoded.service, request.service);
        assert_eq!(decoded.sizing, request.sizing);
    }

    #[test]
    fn test_default_sizing_is_valid() {
        assert!(ChannelSizing::default().validate().is_ok());
    }

    #[test]
    fn test_sizing_bounds() {
        let mut sizing = ChannelSizing::default();
        sizing.request_size = MIN_MESSAGE_SIZE - 1;
        assert_eq!(sizing.validate(), Err(ErrorKind::InvalidParam));

        let mut sizing = ChannelSizing::default();
        sizing.response_size = MAX_MESSAGE_SIZE + 1;
        assert_eq!(sizing.validate(), Err(ErrorKind::TooBig));

        let mut sizing = ChannelSizing::default();
        sizing.dispatch_slots = 2;
        assert_eq!(sizing.validate(), Err(ErrorKind::InvalidParam));
    }

    #[test]
    fn test_rejection_carries_code() {
        let response = ConnectResponse::rejected(ErrorKind::NotSupported);
        match response.result {
            ConnectResult::Rejected { status } => {
                assert_eq!(ErrorKind::from_code(status), ErrorKind::NotSupported);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
