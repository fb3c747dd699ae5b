//! Per-connection state for the client transport.

use crate::zcb::ZcbPool;
use ipc_core::frame::{FlowControlState, Frame, FrameKind};
use ipc_core::handshake::ChannelSizing;
use ipc_core::{ConnectionId, ErrorKind, ServiceId};
use ring_queue::{SyncRingQueue, RECORD_PREFIX};
use std::os::unix::net::UnixStream;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Connected,
    Disconnecting,
    Disconnected,
}

/// Outcome of routing one inbound frame.
pub(crate) enum Routed {
    /// A response frame for the request path to examine
    Response(Frame),
    /// Frame was absorbed into its channel (dispatch, flow control)
    Consumed,
    /// Peer announced orderly teardown
    PeerClosed,
}

/// One client connection; owned by the transport's handle database.
///
/// The request path and the dispatch path may run on different threads,
/// so every piece of state is independently guarded. Reads and writes on
/// the socket use separate clones behind separate locks; `request_lock`
/// additionally serializes whole request/response exchanges (single
/// outstanding request per connection).
pub(crate) struct ClientConnection {
    pub(crate) id: ConnectionId,
    pub(crate) service: ServiceId,
    pub(crate) sizing: ChannelSizing,
    pub(crate) request_lock: Mutex<()>,
    pub(crate) reader: Mutex<UnixStream>,
    pub(crate) writer: Mutex<UnixStream>,
    state: Mutex<ConnectionState>,
    pub(crate) dispatch: SyncRingQueue,
    pub(crate) dispatch_outstanding: AtomicBool,
    flow: Mutex<FlowControlState>,
    pub(crate) zcb: Arc<ZcbPool>,
    pub(crate) reply_buf: Mutex<Vec<u8>>,
    pub(crate) context: Mutex<u64>,
}

impl ClientConnection {
    pub(crate) fn new(
        id: ConnectionId,
        service: ServiceId,
        sizing: ChannelSizing,
        reader: UnixStream,
        writer: UnixStream,
        zcb_limit: usize,
    ) -> Self {
        Self {
            id,
            service,
            sizing,
            request_lock: Mutex::new(()),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            state: Mutex::new(ConnectionState::Connected),
            dispatch: SyncRingQueue::new(sizing.dispatch_slots, sizing.dispatch_size + RECORD_PREFIX),
            dispatch_outstanding: AtomicBool::new(false),
            flow: Mutex::new(FlowControlState::Disabled),
            zcb: ZcbPool::new(zcb_limit),
            reply_buf: Mutex::new(Vec::new()),
            context: Mutex::new(0),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.lock().expect("connection state lock poisoned")
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        *self.state.lock().expect("connection state lock poisoned") = state;
    }

    /// Transitions Connected -> Disconnecting. Returns false when the
    /// teardown already happened (idempotent disconnect).
    pub(crate) fn begin_disconnect(&self) -> bool {
        let mut state = self.state.lock().expect("connection state lock poisoned");
        if *state != ConnectionState::Connected {
            return false;
        }
        *state = ConnectionState::Disconnecting;
        true
    }

    pub(crate) fn ensure_connected(&self) -> Result<(), ErrorKind> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            _ => Err(ErrorKind::BadHandle),
        }
    }

    pub(crate) fn flow_state(&self) -> FlowControlState {
        *self.flow.lock().expect("flow state lock poisoned")
    }

    /// Routes one inbound frame to its logical channel.
    pub(crate) fn route(&self, frame: Frame) -> Result<Routed, ErrorKind> {
        match frame.kind {
            FrameKind::Response { .. } => Ok(Routed::Response(frame)),
            FrameKind::Dispatch => {
                // The delivery credit scheme bounds in-flight events, so
                // a full ring means a peer that ignored its credit.
                if self.dispatch.push_record(&frame.body).is_err() {
                    warn!(connection = %self.id, "dispatch ring full, dropping event");
                }
                Ok(Routed::Consumed)
            }
            FrameKind::FlowControl { state } => {
                trace!(connection = %self.id, %state, "flow control update");
                *self.flow.lock().expect("flow state lock poisoned") = state;
                Ok(Routed::Consumed)
            }
            FrameKind::Disconnect => {
                self.set_state(ConnectionState::Disconnected);
                Ok(Routed::PeerClosed)
            }
            FrameKind::Request { .. } | FrameKind::DispatchCredit => {
                // Server-bound frames arriving at a client mean a corrupt
                // or confused stream.
                Err(ErrorKind::MessageError)
            }
        }
    }
}

/// Applies `deadline` as the socket read timeout; `None` blocks.
pub(crate) fn set_read_deadline(
    stream: &UnixStream,
    deadline: Option<Instant>,
) -> std::io::Result<()> {
    match deadline {
        None => stream.set_read_timeout(None),
        Some(deadline) => {
            let remaining = deadline
                .saturating_duration_since(Instant::now())
                .max(Duration::from_millis(1));
            stream.set_read_timeout(Some(remaining))
        }
    }
}
