//! # IPC Server Transport
//!
//! Accepts connections on a named endpoint and drives them from an
//! external readiness loop: inbound requests run through admission
//! control and the embedding application's handler table, responses and
//! dispatch events flow back out under per-connection flow control.
//!
//! ## Philosophy
//!
//! - **The event loop stays outside**: the transport never polls; the
//!   embedding application owns readiness and calls in through
//!   `handle_accept` / `handle_connection_readable`, registering fds
//!   through the [`PollHooks`] seam
//! - **Handlers must not block**: they run on the event-loop thread and
//!   return a reply (or defer one); slow work belongs elsewhere
//! - **Credits bound the push path**: at most one dispatch frame in
//!   flight per free slot in the client's ring, so a slow consumer
//!   backs pressure up into this side's ring and flips flow control
//!   instead of growing buffers

pub mod connection;

use handle_db::HandleDatabase;
use ipc_core::error::{io_to_library_error, to_library_error};
use ipc_core::frame::{FlowControlState, Frame, FrameKind};
use ipc_core::handshake::{
    read_handshake, write_handshake, ConnectRequest, ConnectResponse, HANDSHAKE_SCHEMA_VERSION,
    MAX_ENDPOINT_NAME,
};
use ipc_core::{ConnectionId, CorrelationId, ErrorKind, MessageId, ServiceId};
use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
use std::fs;
use std::net::Shutdown;
use std::ops::Deref;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

pub use connection::{ConnectionStats, PeerCreds, ServerConnection};
pub use handle_db::Handle;

use connection::ConnectionState;

/// Handshake must complete within this bound; a connector that stalls
/// mid-handshake cannot wedge the accept path.
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Ring occupancy percentage at which flow control flips on.
const FLOW_ENABLE_PERCENT: usize = 90;

/// Ring occupancy percentage at which flow control flips back off.
const FLOW_DISABLE_PERCENT: usize = 50;

/// Readiness interest for a registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollInterest {
    Read,
    ReadWrite,
}

/// Seam to the embedding application's readiness loop. The transport
/// registers and unregisters descriptors through these hooks and never
/// polls on its own.
pub trait PollHooks: Send + Sync {
    /// The listening socket is ready to be watched for accepts.
    fn accept_add(&self, fd: RawFd);
    /// A new connection should be watched for readability.
    fn dispatch_add(&self, fd: RawFd, handle: Handle);
    /// The interest set for a connection changed.
    fn dispatch_modify(&self, _fd: RawFd, _interest: PollInterest) {}
    /// A connection is going away and must leave the readiness set.
    fn dispatch_destroy(&self, fd: RawFd, handle: Handle);
}

/// No-op hooks for embeddings that drive the transport directly.
#[derive(Debug, Default)]
pub struct NullPollHooks;

impl PollHooks for NullPollHooks {
    fn accept_add(&self, _fd: RawFd) {}
    fn dispatch_add(&self, _fd: RawFd, _handle: Handle) {}
    fn dispatch_destroy(&self, _fd: RawFd, _handle: Handle) {}
}

/// Admission decision for one inbound request.
///
/// The token travels to [`ServiceHandlers::sending_allowed_release`],
/// which is invoked whether or not the request was admitted, so a
/// resource reserved while deciding is always returned.
#[derive(Debug)]
pub struct Admission {
    pub decision: Result<(), ErrorKind>,
    pub token: u64,
}

impl Admission {
    /// Admits the request with no reservation attached.
    pub fn allow() -> Self {
        Self {
            decision: Ok(()),
            token: 0,
        }
    }

    /// Rejects the request with the given status.
    pub fn deny(status: ErrorKind) -> Self {
        Self {
            decision: Err(status),
            token: 0,
        }
    }
}

/// What a handler produced for the request it was given.
#[derive(Debug)]
pub enum HandlerResult {
    /// Send this body back as the response
    Reply(Vec<u8>),
    /// The handler will respond later through `response_send`
    NoReply,
}

/// Everything a handler needs to answer one request.
pub struct RequestContext {
    /// The connection the request arrived on
    pub conn: Arc<ServerConnection>,
    /// Correlation to echo into the response
    pub correlation: CorrelationId,
}

/// Resolution hooks supplied by the embedding application.
pub trait ServiceHandlers: Send + Sync {
    /// Whether the service is currently offered on this endpoint.
    fn service_available(&self, service: ServiceId) -> bool;

    /// Bytes of service-private scratch to attach to each connection.
    fn private_data_size(&self, _service: ServiceId) -> usize {
        0
    }

    /// Called once after the handshake succeeds; failing here refuses
    /// the connection.
    fn connection_created(&self, _conn: &ServerConnection) -> Result<(), ErrorKind> {
        Ok(())
    }

    /// Called once during teardown, before the connection is freed.
    fn connection_closed(&self, _conn: &ServerConnection) {}

    /// Credential check at accept time.
    fn security_valid(&self, _uid: u32, _gid: u32) -> bool {
        true
    }

    /// Admission control ahead of each request.
    fn sending_allowed(&self, _service: ServiceId, _message: MessageId, _payload: &[u8]) -> Admission {
        Admission::allow()
    }

    /// Releases whatever `sending_allowed` reserved; called on every
    /// request, admitted or not.
    fn sending_allowed_release(&self, _token: u64) {}

    /// Handles one admitted request.
    fn handle(
        &self,
        ctx: &RequestContext,
        message: MessageId,
        payload: &[u8],
    ) -> Result<HandlerResult, ErrorKind>;

    /// Unrecoverable transport corruption; does not return.
    fn fatal_error(&self, message: &str) -> ! {
        tracing::error!("fatal transport error: {message}");
        std::process::abort()
    }
}

/// Server half of the transport: one listening endpoint, one handler
/// table, one connection database.
pub struct ServerTransport {
    handlers: Arc<dyn ServiceHandlers>,
    poll: Arc<dyn PollHooks>,
    listener: UnixListener,
    endpoint: PathBuf,
    connections: HandleDatabase<ServerConnection>,
}

/// Short-lived reference to a connection, releasing its handle-database
/// reference on drop.
struct ConnRef<'a> {
    db: &'a HandleDatabase<ServerConnection>,
    handle: Handle,
    conn: Arc<ServerConnection>,
}

impl Deref for ConnRef<'_> {
    type Target = ServerConnection;

    fn deref(&self) -> &ServerConnection {
        &self.conn
    }
}

impl Drop for ConnRef<'_> {
    fn drop(&mut self) {
        self.db.put(self.handle);
    }
}

impl ServerTransport {
    /// Binds the named endpoint and registers it with the readiness
    /// loop. A stale socket file from a previous run is removed first.
    pub fn bind(
        endpoint: impl AsRef<Path>,
        handlers: Arc<dyn ServiceHandlers>,
        poll: Arc<dyn PollHooks>,
    ) -> Result<Self, ErrorKind> {
        let endpoint = endpoint.as_ref().to_path_buf();
        if endpoint.as_os_str().len() > MAX_ENDPOINT_NAME {
            return Err(ErrorKind::NameTooLong);
        }
        let _ = fs::remove_file(&endpoint);
        let listener =
            UnixListener::bind(&endpoint).map_err(|err| io_to_library_error(&err))?;
        poll.accept_add(listener.as_raw_fd());
        debug!(endpoint = %endpoint.display(), "endpoint bound");
        Ok(Self {
            handlers,
            poll,
            listener,
            endpoint,
            connections: HandleDatabase::new(),
        })
    }

    /// Endpoint path this transport is bound to.
    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    fn conn(&self, handle: Handle) -> Result<ConnRef<'_>, ErrorKind> {
        let conn = self
            .connections
            .get(handle)
            .map_err(|_| ErrorKind::BadHandle)?;
        Ok(ConnRef {
            db: &self.connections,
            handle,
            conn,
        })
    }

    /// Accepts one pending connection: credential check, service
    /// selection, sizing validation, private-data setup, registration
    /// with the readiness loop.
    pub fn handle_accept(&self) -> Result<Handle, ErrorKind> {
        let (mut stream, _addr) = self
            .listener
            .accept()
            .map_err(|err| io_to_library_error(&err))?;

        let creds = getsockopt(&stream, PeerCredentials)
            .map_err(|err| to_library_error(-(err as i32)))?;
        let creds = PeerCreds {
            uid: creds.uid(),
            gid: creds.gid(),
            pid: creds.pid(),
        };
        if !self.handlers.security_valid(creds.uid, creds.gid) {
            warn!(uid = creds.uid, gid = creds.gid, "connection refused by credential check");
            reject(&mut stream, ErrorKind::AccessDenied);
            return Err(ErrorKind::AccessDenied);
        }

        stream
            .set_read_timeout(Some(ACCEPT_TIMEOUT))
            .map_err(|err| io_to_library_error(&err))?;
        let request: ConnectRequest =
            read_handshake(&mut stream).map_err(|err| err.to_error_kind())?;
        if !request.version.is_compatible_with(&HANDSHAKE_SCHEMA_VERSION) {
            reject(&mut stream, ErrorKind::MessageError);
            return Err(ErrorKind::MessageError);
        }
        if !self.handlers.service_available(request.service) {
            reject(&mut stream, ErrorKind::NotSupported);
            return Err(ErrorKind::NotSupported);
        }
        if let Err(kind) = request.sizing.validate() {
            reject(&mut stream, kind);
            return Err(kind);
        }

        write_handshake(&mut stream, &ConnectResponse::accepted(request.sizing))
            .map_err(|err| err.to_error_kind())?;
        stream
            .set_read_timeout(None)
            .map_err(|err| io_to_library_error(&err))?;

        let reader = stream.try_clone().map_err(|err| io_to_library_error(&err))?;
        let id = ConnectionId::new();
        let conn = ServerConnection::new(
            id,
            request.service,
            request.sizing,
            creds,
            reader,
            stream,
            self.handlers.private_data_size(request.service),
        );
        let handle = self.connections.create(conn);
        let conn = self.conn(handle)?;

        if let Err(kind) = self.handlers.connection_created(&conn) {
            warn!(connection = %id, status = %kind, "connection refused by service init");
            {
                let writer = conn.writer.lock().expect("writer lock poisoned");
                let _ = writer.shutdown(Shutdown::Both);
            }
            conn.set_state(ConnectionState::Disconnected);
            let _ = self.connections.destroy(handle);
            return Err(kind);
        }

        self.poll.dispatch_add(conn.fd, handle);
        debug!(connection = %id, service = %request.service, uid = creds.uid, "connection accepted");
        Ok(handle)
    }

    /// Processes one inbound frame on a readable connection. Returns
    /// `Ok(false)` once the connection has been torn down, after which
    /// the handle is dead.
    pub fn handle_connection_readable(&self, handle: Handle) -> Result<bool, ErrorKind> {
        let conn = self.conn(handle)?;
        let frame = {
            let mut reader = conn.reader.lock().expect("reader lock poisoned");
            Frame::read_from(&mut *reader)
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) if err.is_would_block() => return Ok(true),
            Err(err) if err.is_disconnect() => {
                self.teardown(handle, &conn);
                return Ok(false);
            }
            Err(err) => {
                warn!(connection = %conn.id, error = %err, "corrupt stream");
                self.teardown(handle, &conn);
                return Err(err.to_error_kind());
            }
        };

        match frame.kind {
            FrameKind::Request { message } => {
                conn.counters.requests.fetch_add(1, Ordering::Relaxed);
                let ctx = RequestContext {
                    conn: Arc::clone(&conn.conn),
                    correlation: frame.correlation,
                };
                let admission =
                    self.handlers
                        .sending_allowed(conn.service, message, &frame.body);
                let outcome = match admission.decision {
                    Ok(()) => self.handlers.handle(&ctx, message, &frame.body),
                    Err(kind) => Err(kind),
                };
                self.handlers.sending_allowed_release(admission.token);

                match outcome {
                    Ok(HandlerResult::Reply(body)) => {
                        self.send_response(&conn, frame.correlation, ErrorKind::Ok, &[&body])?;
                    }
                    Ok(HandlerResult::NoReply) => {}
                    Err(kind) => {
                        trace!(connection = %conn.id, %message, status = %kind, "request failed");
                        self.send_response(&conn, frame.correlation, kind, &[])?;
                    }
                }
                Ok(true)
            }
            FrameKind::DispatchCredit => {
                conn.credits.fetch_add(1, Ordering::SeqCst);
                self.flush_dispatch(&conn)?;
                Ok(true)
            }
            FrameKind::Disconnect => {
                self.teardown(handle, &conn);
                Ok(false)
            }
            FrameKind::Response { .. } | FrameKind::Dispatch | FrameKind::FlowControl { .. } => {
                // Client-bound frames arriving at the server mean a
                // corrupt or confused stream.
                warn!(connection = %conn.id, kind = ?frame.kind, "unexpected inbound frame");
                self.teardown(handle, &conn);
                Err(ErrorKind::MessageError)
            }
        }
    }

    /// Sends a response on behalf of a handler that returned `NoReply`.
    pub fn response_send(
        &self,
        handle: Handle,
        correlation: CorrelationId,
        status: ErrorKind,
        body: &[u8],
    ) -> Result<(), ErrorKind> {
        self.response_iov_send(handle, correlation, status, &[body])
    }

    /// Vectored variant of [`response_send`].
    ///
    /// [`response_send`]: ServerTransport::response_send
    pub fn response_iov_send(
        &self,
        handle: Handle,
        correlation: CorrelationId,
        status: ErrorKind,
        body: &[&[u8]],
    ) -> Result<(), ErrorKind> {
        let conn = self.conn(handle)?;
        self.send_response(&conn, correlation, status, body)
    }

    /// Queues an asynchronous event toward the client and flushes as
    /// much of the ring as current credit allows.
    ///
    /// Fails with `QueueFull` when the ring has no free slot; the caller
    /// retries after flow control drains.
    pub fn dispatch_send(&self, handle: Handle, body: &[u8]) -> Result<(), ErrorKind> {
        self.dispatch_iov_send(handle, &[body])
    }

    /// Vectored variant of [`dispatch_send`].
    ///
    /// [`dispatch_send`]: ServerTransport::dispatch_send
    pub fn dispatch_iov_send(&self, handle: Handle, body: &[&[u8]]) -> Result<(), ErrorKind> {
        let conn = self.conn(handle)?;
        conn.ensure_connected()?;
        let total: usize = body.iter().map(|segment| segment.len()).sum();
        if total > conn.sizing.dispatch_size {
            return Err(ErrorKind::TooBig);
        }
        let mut flat = Vec::with_capacity(total);
        for segment in body {
            flat.extend_from_slice(segment);
        }
        if conn.dispatch.push_record(&flat).is_err() {
            conn.counters.dispatch_dropped.fetch_add(1, Ordering::Relaxed);
            return Err(ErrorKind::QueueFull);
        }

        self.flush_dispatch(&conn)?;
        Ok(())
    }

    /// Current flow-control state toward the client.
    pub fn flow_control_state(&self, handle: Handle) -> Result<FlowControlState, ErrorKind> {
        let conn = self.conn(handle)?;
        Ok(conn.flow_state())
    }

    /// Statistics snapshot for one connection.
    pub fn stats(&self, handle: Handle) -> Result<ConnectionStats, ErrorKind> {
        let conn = self.conn(handle)?;
        Ok(conn.stats())
    }

    /// Handles of every live connection, for diagnostics sweeps.
    pub fn active_connections(&self) -> Vec<Handle> {
        self.connections.active_handles()
    }

    /// Takes an extra reference so the connection outlives the handle
    /// database entry, for handlers that complete asynchronously.
    pub fn refcount_inc(&self, handle: Handle) -> Result<(), ErrorKind> {
        let conn = self.conn(handle)?;
        conn.refs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Drops a reference taken with [`refcount_inc`]; the connection is
    /// freed at zero, once teardown has run.
    ///
    /// [`refcount_inc`]: ServerTransport::refcount_inc
    pub fn refcount_dec(&self, handle: Handle) -> Result<(), ErrorKind> {
        let conn = self.conn(handle)?;
        self.release_ref(handle, &conn);
        Ok(())
    }

    fn release_ref(&self, handle: Handle, conn: &ServerConnection) {
        let prev = conn.refs.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "connection reference count underflow");
        if prev == 1 {
            let _ = self.connections.destroy(handle);
        }
    }

    /// Initiates teardown from the server side.
    pub fn disconnect(&self, handle: Handle) -> Result<(), ErrorKind> {
        let conn = match self.connections.get(handle) {
            Ok(conn) => ConnRef {
                db: &self.connections,
                handle,
                conn,
            },
            Err(_) => return Ok(()),
        };
        self.teardown(handle, &conn);
        Ok(())
    }

    fn send_response(
        &self,
        conn: &ServerConnection,
        correlation: CorrelationId,
        status: ErrorKind,
        body: &[&[u8]],
    ) -> Result<(), ErrorKind> {
        conn.ensure_connected()?;
        let total: usize = body.iter().map(|segment| segment.len()).sum();
        if total > conn.sizing.response_size {
            return Err(ErrorKind::TooBig);
        }
        let mut writer = conn.writer.lock().expect("writer lock poisoned");
        Frame::write_parts(
            &mut *writer,
            FrameKind::Response {
                status: status.code(),
            },
            correlation,
            body,
        )
        .map_err(|err| {
            if err.is_disconnect() {
                conn.set_state(ConnectionState::Disconnected);
                ErrorKind::LibraryError
            } else {
                err.to_error_kind()
            }
        })?;
        conn.counters.responses.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn set_flow(&self, conn: &ServerConnection, state: FlowControlState) -> Result<(), ErrorKind> {
        *conn.flow.lock().expect("flow state lock poisoned") = state;
        match state {
            FlowControlState::Enabled => {
                conn.counters.flow_enabled.fetch_add(1, Ordering::Relaxed)
            }
            FlowControlState::Disabled => {
                conn.counters.flow_disabled.fetch_add(1, Ordering::Relaxed)
            }
        };
        trace!(connection = %conn.id, %state, "flow control transition");
        let mut writer = conn.writer.lock().expect("writer lock poisoned");
        Frame::flow_control(state)
            .write_to(&mut *writer)
            .map_err(|err| err.to_error_kind())
    }

    /// Drains the dispatch ring toward the client, one frame per
    /// available credit, adjusting flow control on both edges.
    ///
    /// Senders and the credit path call this concurrently; the flush
    /// lock keeps peek, write, dequeue and the credit decrement as one
    /// unit, so each queued event leaves exactly once and in ring
    /// order.
    fn flush_dispatch(&self, conn: &ServerConnection) -> Result<(), ErrorKind> {
        let _flush = conn.flush_lock.lock().expect("flush lock poisoned");

        let capacity = conn.sizing.dispatch_slots - 2;
        if conn.dispatch.current_occupancy() * 100 >= capacity * FLOW_ENABLE_PERCENT
            && conn.flow_state() == FlowControlState::Disabled
        {
            self.set_flow(conn, FlowControlState::Enabled)?;
        }

        loop {
            if conn.credits.load(Ordering::SeqCst) == 0 {
                break;
            }
            let record = match conn.dispatch.peek_record() {
                Some(record) => record,
                None => break,
            };
            if record.len() > conn.sizing.dispatch_size {
                self.handlers.fatal_error("dispatch ring record exceeds channel size");
            }
            {
                let mut writer = conn.writer.lock().expect("writer lock poisoned");
                Frame::dispatch(record).write_to(&mut *writer).map_err(|err| {
                    if err.is_disconnect() {
                        conn.set_state(ConnectionState::Disconnected);
                        ErrorKind::LibraryError
                    } else {
                        err.to_error_kind()
                    }
                })?;
            }
            conn.dispatch.dequeue();
            conn.credits.fetch_sub(1, Ordering::SeqCst);
            conn.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        }

        if conn.flow_state() == FlowControlState::Enabled
            && conn.dispatch.current_occupancy() * 100 <= capacity * FLOW_DISABLE_PERCENT
        {
            self.set_flow(conn, FlowControlState::Disabled)?;
        }
        Ok(())
    }

    fn teardown(&self, handle: Handle, conn: &ServerConnection) {
        if !conn.begin_disconnect() {
            return;
        }
        self.poll.dispatch_destroy(conn.fd, handle);
        {
            let mut writer = conn.writer.lock().expect("writer lock poisoned");
            // Best effort: the peer may already be gone.
            let _ = Frame::disconnect().write_to(&mut *writer);
            let _ = writer.shutdown(Shutdown::Both);
        }
        conn.set_state(ConnectionState::Disconnected);
        self.handlers.connection_closed(conn);
        debug!(connection = %conn.id, stats = ?conn.stats(), "connection closed");
        // Drop the transport's own reference; the entry is freed once
        // handlers release theirs too.
        self.release_ref(handle, conn);
    }
}

impl Drop for ServerTransport {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.endpoint);
    }
}

fn reject(stream: &mut UnixStream, status: ErrorKind) {
    let _ = write_handshake(stream, &ConnectResponse::rejected(status));
}
