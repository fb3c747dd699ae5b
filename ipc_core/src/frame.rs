//! Wire frames shared by both transport halves.
//!
//! A connection carries several logical channels (request/response,
//! dispatch, flow control) over one byte stream; frames tag which channel
//! a payload belongs to. The frame header is a small serde_json envelope
//! behind a fixed-size length prefix; the body is opaque bytes and is
//! never re-encoded.

use crate::ids::{CorrelationId, MessageId, SchemaVersion};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use thiserror::Error;

/// Frame schema version (v1.0).
pub const FRAME_SCHEMA_VERSION: SchemaVersion = SchemaVersion::new(1, 0);

/// Upper bound on a frame body, independent of negotiated channel sizes.
pub const MAX_FRAME_BODY: usize = 1 << 20;

/// Upper bound on the encoded header; a larger prefix means a corrupt or
/// hostile stream.
const MAX_FRAME_HEADER: usize = 64 * 1024;

/// Server-to-client send throttling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowControlState {
    /// Sends may proceed
    Disabled,
    /// Channels are near capacity; callers should stop sending
    Enabled,
}

impl fmt::Display for FlowControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowControlState::Disabled => write!(f, "flow-control-disabled"),
            FlowControlState::Enabled => write!(f, "flow-control-enabled"),
        }
    }
}

/// Which logical channel a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    /// Client-to-server request; `message` selects the handler.
    Request { message: MessageId },
    /// Server-to-client answer to a request; `status` is an
    /// [`ErrorKind`](crate::ErrorKind) code.
    Response { status: i32 },
    /// Asynchronous server-pushed event.
    Dispatch,
    /// Flow-control state change notification.
    FlowControl { state: FlowControlState },
    /// Client acknowledges a dispatch buffer, returning delivery credit.
    DispatchCredit,
    /// Orderly connection teardown.
    Disconnect,
}

/// Envelope metadata written ahead of the body.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FrameHeader {
    version: SchemaVersion,
    kind: FrameKind,
    correlation: CorrelationId,
    body_len: u32,
}

/// One tagged unit on the connection byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Channel tag
    pub kind: FrameKind,
    /// Correlates responses to the request that solicited them
    pub correlation: CorrelationId,
    /// Opaque body bytes
    pub body: Vec<u8>,
}

/// Errors while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Frame exceeds size bound ({0} bytes)")]
    TooLarge(usize),

    #[error("Incompatible frame schema version {0}")]
    IncompatibleVersion(SchemaVersion),
}

impl FrameError {
    /// Returns true when the underlying stream has been closed by the
    /// peer rather than corrupted.
    pub fn is_disconnect(&self) -> bool {
        match self {
            FrameError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }

    /// Returns true when the read simply timed out or would block.
    pub fn is_would_block(&self) -> bool {
        match self {
            FrameError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Collapses the error into a library result code.
    pub fn to_error_kind(&self) -> crate::ErrorKind {
        match self {
            FrameError::Io(err) => crate::error::io_to_library_error(err),
            FrameError::Codec(_) => crate::ErrorKind::MessageError,
            FrameError::TooLarge(_) => crate::ErrorKind::TooBig,
            FrameError::IncompatibleVersion(_) => crate::ErrorKind::MessageError,
        }
    }
}

impl Frame {
    /// Builds a request frame with a fresh correlation ID.
    pub fn request(message: MessageId, body: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Request { message },
            correlation: CorrelationId::new(),
            body,
        }
    }

    /// Builds the response to `correlation` with the given status code.
    pub fn response(correlation: CorrelationId, status: i32, body: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Response { status },
            correlation,
            body,
        }
    }

    /// Builds a dispatch event frame.
    pub fn dispatch(body: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Dispatch,
            correlation: CorrelationId::new(),
            body,
        }
    }

    /// Builds a flow-control notification frame.
    pub fn flow_control(state: FlowControlState) -> Self {
        Self {
            kind: FrameKind::FlowControl { state },
            correlation: CorrelationId::new(),
            body: Vec::new(),
        }
    }

    /// Builds a dispatch-credit frame.
    pub fn dispatch_credit() -> Self {
        Self {
            kind: FrameKind::DispatchCredit,
            correlation: CorrelationId::new(),
            body: Vec::new(),
        }
    }

    /// Builds a disconnect frame.
    pub fn disconnect() -> Self {
        Self {
            kind: FrameKind::Disconnect,
            correlation: CorrelationId::new(),
            body: Vec::new(),
        }
    }

    /// Writes the frame to a byte stream: length prefix, header, body.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), FrameError> {
        Self::write_parts(writer, self.kind, self.correlation, &[&self.body])
    }

    /// Writes a frame from body segments without gathering them into one
    /// allocation first; the zero-copy send path hands its buffer
    /// straight to the stream.
    pub fn write_parts<W: Write>(
        writer: &mut W,
        kind: FrameKind,
        correlation: CorrelationId,
        body: &[&[u8]],
    ) -> Result<(), FrameError> {
        let body_len: usize = body.iter().map(|segment| segment.len()).sum();
        if body_len > MAX_FRAME_BODY {
            return Err(FrameError::TooLarge(body_len));
        }
        let header = FrameHeader {
            version: FRAME_SCHEMA_VERSION,
            kind,
            correlation,
            body_len: body_len as u32,
        };
        let encoded = serde_json::to_vec(&header)?;
        writer.write_all(&(encoded.len() as u32).to_le_bytes())?;
        writer.write_all(&encoded)?;
        for segment in body {
            writer.write_all(segment)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Reads one frame from a byte stream.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Frame, FrameError> {
        let mut prefix = [0u8; 4];
        reader.read_exact(&mut prefix)?;
        let header_len = u32::from_le_bytes(prefix) as usize;
        if header_len > MAX_FRAME_HEADER {
            return Err(FrameError::TooLarge(header_len));
        }
        let mut header_buf = vec![0u8; header_len];
        reader.read_exact(&mut header_buf)?;
        let header: FrameHeader = serde_json::from_slice(&header_buf)?;
        if !header.version.is_compatible_with(&FRAME_SCHEMA_VERSION) {
            return Err(FrameError::IncompatibleVersion(header.version));
        }
        let body_len = header.body_len as usize;
        if body_len > MAX_FRAME_BODY {
            return Err(FrameError::TooLarge(body_len));
        }
        let mut body = vec![0u8; body_len];
        reader.read_exact(&mut body)?;
        Ok(Frame {
            kind: header.kind,
            correlation: header.correlation,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::request(MessageId::new(3), b"payload".to_vec());
        let mut wire = Vec::new();
        frame.write_to(&mut wire).unwrap();

        let decoded = Frame::read_from(&mut wire.as_slice()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_response_carries_status() {
        let correlation = CorrelationId::new();
        let frame = Frame::response(correlation, 6, Vec::new());
        let mut wire = Vec::new();
        frame.write_to(&mut wire).unwrap();

        let decoded = Frame::read_from(&mut wire.as_slice()).unwrap();
        assert_eq!(decoded.kind, FrameKind::Response { status: 6 });
        assert_eq!(decoded.correlation, correlation);
    }

    #[test]
    fn test_write_parts_gathers_segments() {
        let correlation = CorrelationId::new();
        let mut wire = Vec::new();
        Frame::write_parts(
            &mut wire,
            FrameKind::Dispatch,
            correlation,
            &[b"abc", b"", b"def"],
        )
        .unwrap();

        let decoded = Frame::read_from(&mut wire.as_slice()).unwrap();
        assert_eq!(decoded.body, b"abcdef");
        assert_eq!(decoded.correlation, correlation);
    }

    #[test]
    fn test_oversized_body_rejected() {
        let frame = Frame::dispatch(vec![0u8; MAX_FRAME_BODY + 1]);
        let mut wire = Vec::new();
        assert!(matches!(
            frame.write_to(&mut wire),
            Err(FrameError::TooLarge(_))
        ));
    }

    #[test]
    fn test_truncated_stream_is_disconnect() {
        let frame = Frame::dispatch(b"event".to_vec());
        let mut wire = Vec::new();
        frame.write_to(&mut wire).unwrap();
        wire.truncate(wire.len() - 2);

        let err = Frame::read_from(&mut wire.as_slice()).unwrap_err();
        assert!(err.is_disconnect());
    }

    #[test]
    fn test_corrupt_header_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&8u32.to_le_bytes());
        wire.extend_from_slice(b"not json");
        assert!(matches!(
            Frame::read_from(&mut wire.as_slice()),
            Err(FrameError::Codec(_))
        ));
    }
}
