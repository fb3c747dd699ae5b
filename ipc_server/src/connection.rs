//! Per-connection state for the server transport.

use ipc_core::frame::FlowControlState;
use ipc_core::handshake::ChannelSizing;
use ipc_core::{ConnectionId, ErrorKind, ServiceId};
use ring_queue::{SyncRingQueue, RECORD_PREFIX};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Connected,
    Disconnecting,
    Disconnected,
}

/// Peer credentials captured at accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCreds {
    pub uid: u32,
    pub gid: u32,
    pub pid: i32,
}

/// Snapshot of one connection's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Requests read off the wire
    pub requests: u64,
    /// Response frames written
    pub responses: u64,
    /// Dispatch events flushed to the client
    pub dispatched: u64,
    /// Events dropped because the dispatch ring was full
    pub dispatch_dropped: u64,
    /// Disabled -> Enabled flow transitions
    pub flow_enabled: u64,
    /// Enabled -> Disabled flow transitions
    pub flow_disabled: u64,
    /// Peak occupancy of the dispatch ring
    pub dispatch_high_water: usize,
    /// Current occupancy of the dispatch ring
    pub dispatch_queued: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) requests: AtomicU64,
    pub(crate) responses: AtomicU64,
    pub(crate) dispatched: AtomicU64,
    pub(crate) dispatch_dropped: AtomicU64,
    pub(crate) flow_enabled: AtomicU64,
    pub(crate) flow_disabled: AtomicU64,
}

/// One accepted connection; owned by the transport's handle database.
///
/// The event loop reads frames on one thread while handlers and other
/// services push dispatch events from any thread, so the socket halves
/// and each piece of state are guarded independently. `refs` is the
/// service-visible reference count, separate from the handle-database
/// count, so a handler can retain the connection across an async
/// completion.
pub struct ServerConnection {
    pub(crate) id: ConnectionId,
    pub(crate) service: ServiceId,
    pub(crate) sizing: ChannelSizing,
    pub(crate) creds: PeerCreds,
    pub(crate) fd: RawFd,
    pub(crate) reader: Mutex<UnixStream>,
    pub(crate) writer: Mutex<UnixStream>,
    state: Mutex<ConnectionState>,
    pub(crate) refs: AtomicU32,
    pub(crate) dispatch: SyncRingQueue,
    /// Free slots in the client's dispatch ring; one Dispatch frame in
    /// flight per credit, one credit back per acknowledged buffer.
    pub(crate) credits: AtomicU32,
    /// Serializes ring flushes. Senders and the credit path both drain
    /// the ring; without this lock two flushers could write the same
    /// head record and spend the same credit twice.
    pub(crate) flush_lock: Mutex<()>,
    pub(crate) flow: Mutex<FlowControlState>,
    pub(crate) counters: Counters,
    private_data: Mutex<Vec<u8>>,
}

impl ServerConnection {
    pub(crate) fn new(
        id: ConnectionId,
        service: ServiceId,
        sizing: ChannelSizing,
        creds: PeerCreds,
        reader: UnixStream,
        writer: UnixStream,
        private_data_size: usize,
    ) -> Self {
        let fd = writer.as_raw_fd();
        // The client ring mirrors ours, so its free-slot count starts at
        // the negotiated ring capacity.
        let credits = (sizing.dispatch_slots - 2) as u32;
        Self {
            id,
            service,
            sizing,
            creds,
            fd,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            state: Mutex::new(ConnectionState::Connected),
            refs: AtomicU32::new(1),
            dispatch: SyncRingQueue::new(sizing.dispatch_slots, sizing.dispatch_size + RECORD_PREFIX),
            credits: AtomicU32::new(credits),
            flush_lock: Mutex::new(()),
            flow: Mutex::new(FlowControlState::Disabled),
            counters: Counters::default(),
            private_data: Mutex::new(vec![0u8; private_data_size]),
        }
    }

    /// Connection identifier, stable for the connection's lifetime.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Service this connection was accepted for.
    pub fn service(&self) -> ServiceId {
        self.service
    }

    /// Credentials of the connecting process.
    pub fn peer_creds(&self) -> PeerCreds {
        self.creds
    }

    /// Service-private scratch area, sized at accept time.
    pub fn private_data(&self) -> MutexGuard<'_, Vec<u8>> {
        self.private_data.lock().expect("private data lock poisoned")
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

    /// Statistics snapshot.
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            requests: self.counters.requests.load(Ordering::Relaxed),
            responses: self.counters.responses.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            dispatch_dropped: self.counters.dispatch_dropped.load(Ordering::Relaxed),
            flow_enabled: self.counters.flow_enabled.load(Ordering::Relaxed),
            flow_disabled: self.counters.flow_disabled.load(Ordering::Relaxed),
            dispatch_high_water: self.dispatch.high_water_mark(),
            dispatch_queued: self.dispatch.current_occupancy(),
        }
    }
}
