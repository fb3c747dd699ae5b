//! # IPC Client Transport
//!
//! Connects to a named server endpoint and exposes the four client-side
//! primitives: synchronous request/response, asynchronous dispatch
//! polling, flow-control queries, and zero-copy buffers for oversized
//! payloads.
//!
//! ## Philosophy
//!
//! - **Handles, not pointers**: `connect` returns an opaque handle into
//!   the transport's handle database; every operation converts it back
//!   through `get`/`put` so a concurrent `disconnect` is always safe
//! - **One socket, tagged channels**: responses, dispatch events, and
//!   flow-control updates share the stream and are routed by frame kind,
//!   so a blocked request never loses a dispatch event
//! - **Bounded waits**: every blocking call takes a timeout; `None`
//!   blocks indefinitely, a zero duration is a non-blocking poll

pub mod connection;
pub mod zcb;

use connection::{set_read_deadline, ClientConnection, ConnectionState, Routed};
use handle_db::HandleDatabase;
use ipc_core::error::io_to_library_error;
use ipc_core::frame::{FlowControlState, Frame, FrameKind};
use ipc_core::handshake::{
    read_handshake, write_handshake, ChannelSizing, ConnectRequest, ConnectResponse,
    ConnectResult, HANDSHAKE_SCHEMA_VERSION, MAX_ENDPOINT_NAME,
};
use ipc_core::{ConnectionId, CorrelationId, ErrorKind, MessageId, ServiceId};
use std::net::Shutdown;
use std::ops::Deref;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

pub use handle_db::Handle;
pub use zcb::{ZcbBuffer, DEFAULT_POOL_BYTES};

/// How long one socket poll may hold the reader lock on the dispatch
/// path before re-checking the dispatch ring.
const POLL_SLICE: Duration = Duration::from_millis(50);

/// Handshake must complete within this bound.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client half of the transport. One instance per process is typical,
/// owned by whichever component constructs the service.
pub struct ClientTransport {
    connections: HandleDatabase<ClientConnection>,
}

/// Short-lived reference to a connection, releasing its handle-database
/// reference on drop. Never held across a blocking call boundary that
/// outlives the operation.
struct ConnRef<'a> {
    db: &'a HandleDatabase<ClientConnection>,
    handle: Handle,
    conn: Arc<ClientConnection>,
}

impl Deref for ConnRef<'_> {
    type Target = ClientConnection;

    fn deref(&self) -> &ClientConnection {
        &self.conn
    }
}

impl Drop for ConnRef<'_> {
    fn drop(&mut self) {
        self.db.put(self.handle);
    }
}

/// Response bytes held in the transport-owned buffer, valid until the
/// next in-buf call on the same connection.
pub struct ReplyBuf {
    conn: Arc<ClientConnection>,
}

impl ReplyBuf {
    /// Borrows the reply bytes.
    pub fn bytes(&self) -> ReplyBytes<'_> {
        ReplyBytes(self.conn.reply_buf.lock().expect("reply buffer lock poisoned"))
    }

    /// Reply length in bytes.
    pub fn len(&self) -> usize {
        self.bytes().0.len()
    }

    /// Returns whether the reply body is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Guard dereferencing to the reply bytes.
pub struct ReplyBytes<'a>(MutexGuard<'a, Vec<u8>>);

impl Deref for ReplyBytes<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl Default for ClientTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientTransport {
    /// Creates a transport with an empty connection database.
    pub fn new() -> Self {
        Self {
            connections: HandleDatabase::new(),
        }
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

    /// Opens a connection to the named endpoint, performs the
    /// service-selection handshake, and returns an opaque context
    /// handle.
    ///
    /// Fails with `NotSupported` when the requested service is
    /// unavailable at that endpoint and `AccessDenied` on credential
    /// rejection.
    pub fn connect(
        &self,
        endpoint: impl AsRef<Path>,
        service: ServiceId,
        sizing: ChannelSizing,
    ) -> Result<Handle, ErrorKind> {
        let endpoint = endpoint.as_ref();
        if endpoint.as_os_str().len() > MAX_ENDPOINT_NAME {
            return Err(ErrorKind::NameTooLong);
        }
        sizing.validate()?;

        let mut stream =
            UnixStream::connect(endpoint).map_err(|err| io_to_library_error(&err))?;
        stream
            .set_read_timeout(Some(CONNECT_TIMEOUT))
            .map_err(|err| io_to_library_error(&err))?;

        write_handshake(&mut stream, &ConnectRequest::new(service, sizing))
            .map_err(|err| err.to_error_kind())?;
        let response: ConnectResponse =
            read_handshake(&mut stream).map_err(|err| err.to_error_kind())?;
        if !response.version.is_compatible_with(&HANDSHAKE_SCHEMA_VERSION) {
            return Err(ErrorKind::MessageError);
        }
        let sizing = match response.result {
            ConnectResult::Accepted { sizing } => sizing,
            ConnectResult::Rejected { status } => {
                let kind = ErrorKind::from_code(status);
                return Err(if kind.is_ok() { ErrorKind::LibraryError } else { kind });
            }
        };

        stream
            .set_read_timeout(None)
            .map_err(|err| io_to_library_error(&err))?;
        let reader = stream.try_clone().map_err(|err| io_to_library_error(&err))?;
        let id = ConnectionId::new();
        let conn = ClientConnection::new(id, service, sizing, reader, stream, DEFAULT_POOL_BYTES);
        let handle = self.connections.create(conn);
        debug!(connection = %id, %service, "connected");
        Ok(handle)
    }

    /// Tears down the connection. Idempotent: a context that is already
    /// disconnected (or was never valid) reports success, honoring the
    /// at-most-once teardown contract.
    pub fn disconnect(&self, handle: Handle) -> Result<(), ErrorKind> {
        let conn = match self.connections.get(handle) {
            Ok(conn) => conn,
            Err(_) => return Ok(()),
        };
        if conn.begin_disconnect() {
            {
                let mut writer = conn.writer.lock().expect("writer lock poisoned");
                // Best effort: the peer may already be gone.
                let _ = Frame::disconnect().write_to(&mut *writer);
                let _ = writer.shutdown(Shutdown::Both);
            }
            conn.set_state(ConnectionState::Disconnected);
            debug!(connection = %conn.id, "disconnected");
            let _ = self.connections.destroy(handle);
        }
        self.connections.put(handle);
        Ok(())
    }

    /// Sends a request and blocks until the matching response arrives,
    /// copying it into `response`. Returns the response length.
    ///
    /// Fails with `TryAgain` without blocking while the server's
    /// flow-control state is enabled, and with `Timeout` when no
    /// response arrives within `timeout`.
    pub fn request_response(
        &self,
        handle: Handle,
        message: MessageId,
        request: &[u8],
        response: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize, ErrorKind> {
        self.request_iov_response(handle, message, &[request], response, timeout)
    }

    /// Vectored variant of [`request_response`]; the segments are
    /// gathered on the wire without an intermediate copy.
    ///
    /// [`request_response`]: ClientTransport::request_response
    pub fn request_iov_response(
        &self,
        handle: Handle,
        message: MessageId,
        request: &[&[u8]],
        response: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize, ErrorKind> {
        let conn = self.conn(handle)?;
        let body = roundtrip(&conn, message, request, timeout)?;
        copy_response(&body, response)
    }

    /// In-buf variant: the response stays in a transport-owned buffer,
    /// valid until the next in-buf call on the same connection.
    pub fn request_response_in_buf(
        &self,
        handle: Handle,
        message: MessageId,
        request: &[u8],
        timeout: Option<Duration>,
    ) -> Result<ReplyBuf, ErrorKind> {
        let conn = self.conn(handle)?;
        let body = roundtrip(&conn, message, &[request], timeout)?;
        *conn.reply_buf.lock().expect("reply buffer lock poisoned") = body;
        Ok(ReplyBuf {
            conn: Arc::clone(&conn.conn),
        })
    }

    /// Polls or blocks for the next server-pushed dispatch event.
    ///
    /// A zero timeout is a non-blocking poll; `None` blocks
    /// indefinitely. At most one dispatch buffer may be outstanding per
    /// connection; it must be released with [`dispatch_put`] before the
    /// next call.
    ///
    /// [`dispatch_put`]: ClientTransport::dispatch_put
    pub fn dispatch_get(
        &self,
        handle: Handle,
        timeout: Option<Duration>,
    ) -> Result<Option<Vec<u8>>, ErrorKind> {
        let conn = self.conn(handle)?;
        if conn.dispatch_outstanding.load(Ordering::SeqCst) {
            return Err(ErrorKind::Busy);
        }
        if timeout == Some(Duration::ZERO) {
            // Non-blocking poll: route whatever the socket already
            // buffered, then claim from the ring or report empty.
            drain_pending(&conn)?;
            return claim_dispatch(&conn);
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(record) = claim_dispatch(&conn)? {
                return Ok(Some(record));
            }

            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    (deadline - now).min(POLL_SLICE)
                }
                None => POLL_SLICE,
            };

            // Pull pending frames off the socket unless the request path
            // is already draining it; then it will route dispatch events
            // into the ring for us.
            match conn.reader.try_lock() {
                Ok(mut reader) => {
                    reader
                        .set_read_timeout(Some(slice.max(Duration::from_millis(1))))
                        .map_err(|err| io_to_library_error(&err))?;
                    match Frame::read_from(&mut *reader) {
                        Ok(frame) => match conn.route(frame)? {
                            Routed::Consumed => {}
                            // A response nobody is waiting for: the late
                            // reply to a timed-out request. Discarded.
                            Routed::Response(_) => {}
                            Routed::PeerClosed => return Err(ErrorKind::LibraryError),
                        },
                        Err(err) if err.is_would_block() => {}
                        Err(err) if err.is_disconnect() => {
                            conn.set_state(ConnectionState::Disconnected);
                            return Err(ErrorKind::LibraryError);
                        }
                        Err(err) => return Err(err.to_error_kind()),
                    }
                }
                Err(_) => {
                    let _ = conn.dispatch.wait_peek_record(Some(slice));
                }
            }
        }
    }

    /// Releases the buffer returned by the previous [`dispatch_get`],
    /// making room for the next event and returning the delivery credit
    /// to the server.
    ///
    /// [`dispatch_get`]: ClientTransport::dispatch_get
    pub fn dispatch_put(&self, handle: Handle) -> Result<(), ErrorKind> {
        let conn = self.conn(handle)?;
        if !conn.dispatch_outstanding.load(Ordering::SeqCst) {
            return Err(ErrorKind::InvalidParam);
        }
        conn.dispatch.dequeue();
        conn.dispatch_outstanding.store(false, Ordering::SeqCst);

        let mut writer = conn.writer.lock().expect("writer lock poisoned");
        if let Err(err) = Frame::dispatch_credit().write_to(&mut *writer) {
            // Peer already gone: the local slot is released either way.
            if !err.is_disconnect() {
                return Err(err.to_error_kind());
            }
        }
        Ok(())
    }

    /// Non-blocking query of the current send-throttling state.
    pub fn dispatch_flow_control_get(
        &self,
        handle: Handle,
    ) -> Result<FlowControlState, ErrorKind> {
        let conn = self.conn(handle)?;
        Ok(conn.flow_state())
    }

    /// Allocates an oversized payload buffer out of the connection's
    /// zero-copy pool.
    pub fn zcb_alloc(&self, handle: Handle, size: usize) -> Result<ZcbBuffer, ErrorKind> {
        let conn = self.conn(handle)?;
        conn.zcb.alloc(size)
    }

    /// Releases a buffer obtained from [`zcb_alloc`] on this connection.
    ///
    /// [`zcb_alloc`]: ClientTransport::zcb_alloc
    pub fn zcb_free(&self, handle: Handle, buffer: ZcbBuffer) -> Result<(), ErrorKind> {
        let conn = self.conn(handle)?;
        if !conn.zcb.owns(&buffer) {
            return Err(ErrorKind::InvalidParam);
        }
        drop(buffer);
        Ok(())
    }

    /// Total bytes currently allocated out of the connection's
    /// zero-copy pool.
    pub fn zcb_allocated(&self, handle: Handle) -> Result<usize, ErrorKind> {
        let conn = self.conn(handle)?;
        Ok(conn.zcb.allocated())
    }

    /// Sends a zero-copy buffer as the request body and blocks for the
    /// response, without copying the payload into another allocation.
    pub fn zcb_send_reply_receive(
        &self,
        handle: Handle,
        message: MessageId,
        buffer: &ZcbBuffer,
        response: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize, ErrorKind> {
        let conn = self.conn(handle)?;
        if !conn.zcb.owns(buffer) {
            return Err(ErrorKind::InvalidParam);
        }
        let body = roundtrip(&conn, message, &[&buffer[..]], timeout)?;
        copy_response(&body, response)
    }

    /// Stores a caller-private token on the connection.
    pub fn context_set(&self, handle: Handle, context: u64) -> Result<(), ErrorKind> {
        let conn = self.conn(handle)?;
        *conn.context.lock().expect("context lock poisoned") = context;
        Ok(())
    }

    /// Reads back the caller-private token.
    pub fn context_get(&self, handle: Handle) -> Result<u64, ErrorKind> {
        let conn = self.conn(handle)?;
        let context = *conn.context.lock().expect("context lock poisoned");
        Ok(context)
    }

    /// Raw file descriptor of the connection, for embedding poll loops
    /// on the dispatch path.
    pub fn fd(&self, handle: Handle) -> Result<RawFd, ErrorKind> {
        let conn = self.conn(handle)?;
        let reader = conn.reader.lock().expect("reader lock poisoned");
        Ok(reader.as_raw_fd())
    }
}

/// Claims the oldest queued dispatch event for the caller, leaving it
/// in the ring until `dispatch_put` releases it.
fn claim_dispatch(conn: &ClientConnection) -> Result<Option<Vec<u8>>, ErrorKind> {
    loop {
        if conn.dispatch.peek_record().is_none() {
            return Ok(None);
        }
        if conn
            .dispatch_outstanding
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ErrorKind::Busy);
        }
        match conn.dispatch.peek_record() {
            Some(record) => return Ok(Some(record)),
            None => {
                // Raced another consumer between peek and claim.
                conn.dispatch_outstanding.store(false, Ordering::SeqCst);
            }
        }
    }
}

/// Routes every frame the socket already buffered, without blocking.
///
/// `O_NONBLOCK` applies to the shared file description, so the writer
/// lock is held while the flag is set to keep concurrent sends off the
/// socket.
fn drain_pending(conn: &ClientConnection) -> Result<(), ErrorKind> {
    let mut reader = match conn.reader.try_lock() {
        Ok(reader) => reader,
        // The request path owns the socket and routes for us.
        Err(_) => return Ok(()),
    };
    let _writer = conn.writer.lock().expect("writer lock poisoned");
    reader
        .set_nonblocking(true)
        .map_err(|err| io_to_library_error(&err))?;
    let drained = loop {
        match Frame::read_from(&mut *reader) {
            Ok(frame) => match conn.route(frame) {
                Ok(Routed::Consumed) | Ok(Routed::Response(_)) => {}
                Ok(Routed::PeerClosed) => break Err(ErrorKind::LibraryError),
                Err(kind) => break Err(kind),
            },
            Err(err) if err.is_would_block() => break Ok(()),
            Err(err) if err.is_disconnect() => {
                conn.set_state(ConnectionState::Disconnected);
                break Err(ErrorKind::LibraryError);
            }
            Err(err) => break Err(err.to_error_kind()),
        }
    };
    let restored = reader.set_nonblocking(false);
    drained?;
    restored.map_err(|err| io_to_library_error(&err))
}

/// One full request/response exchange; the caller owns the exclusivity
/// and flow-control checks through this path.
fn roundtrip(
    conn: &ClientConnection,
    message: MessageId,
    request: &[&[u8]],
    timeout: Option<Duration>,
) -> Result<Vec<u8>, ErrorKind> {
    conn.ensure_connected()?;
    if conn.flow_state() == FlowControlState::Enabled {
        return Err(ErrorKind::TryAgain);
    }
    let total: usize = request.iter().map(|segment| segment.len()).sum();
    if total > conn.sizing.request_size {
        return Err(ErrorKind::TooBig);
    }

    // Single outstanding request per connection.
    let _exclusive = conn.request_lock.lock().expect("request lock poisoned");
    let correlation = CorrelationId::new();
    {
        let mut writer = conn.writer.lock().expect("writer lock poisoned");
        Frame::write_parts(&mut *writer, FrameKind::Request { message }, correlation, request)
            .map_err(|err| {
                if err.is_disconnect() {
                    conn.set_state(ConnectionState::Disconnected);
                    ErrorKind::LibraryError
                } else {
                    err.to_error_kind()
                }
            })?;
    }

    let deadline = timeout.map(|t| Instant::now() + t);
    let mut reader = conn.reader.lock().expect("reader lock poisoned");
    loop {
        set_read_deadline(&reader, deadline).map_err(|err| io_to_library_error(&err))?;
        match Frame::read_from(&mut *reader) {
            Ok(frame) => match conn.route(frame)? {
                Routed::Response(frame) => {
                    if frame.correlation != correlation {
                        // Late reply to a previously timed-out request;
                        // the server processed it, we discard it.
                        continue;
                    }
                    if let FrameKind::Response { status } = frame.kind {
                        ErrorKind::from_code(status).into_result()?;
                    }
                    if frame.body.len() > conn.sizing.response_size {
                        return Err(ErrorKind::TooBig);
                    }
                    return Ok(frame.body);
                }
                Routed::Consumed => {}
                Routed::PeerClosed => return Err(ErrorKind::LibraryError),
            },
            Err(err) if err.is_would_block() => return Err(ErrorKind::Timeout),
            Err(err) if err.is_disconnect() => {
                conn.set_state(ConnectionState::Disconnected);
                return Err(ErrorKind::LibraryError);
            }
            Err(err) => return Err(err.to_error_kind()),
        }
    }
}

fn copy_response(body: &[u8], out: &mut [u8]) -> Result<usize, ErrorKind> {
    if body.len() > out.len() {
        return Err(ErrorKind::TooBig);
    }
    out[..body.len()].copy_from_slice(body);
    Ok(body.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::path::PathBuf;
    use std::thread;

    fn endpoint() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipc.sock");
        (dir, path)
    }

    /// Accepts one connection and completes the handshake, granting the
    /// requested sizing unchanged.
    fn accept_service(listener: &UnixListener) -> UnixStream {
        let (mut stream, _) = listener.accept().unwrap();
        let request: ConnectRequest = read_handshake(&mut stream).unwrap();
        write_handshake(&mut stream, &ConnectResponse::accepted(request.sizing)).unwrap();
        stream
    }

    fn small_sizing() -> ChannelSizing {
        ChannelSizing {
            request_size: 256,
            response_size: 256,
            dispatch_size: 256,
            dispatch_slots: 6,
        }
    }

    #[test]
    fn test_request_response_echo_reversed() {
        let (_dir, path) = endpoint();
        let listener = UnixListener::bind(&path).unwrap();
        let server = thread::spawn(move || {
            let mut stream = accept_service(&listener);
            let frame = Frame::read_from(&mut stream).unwrap();
            let mut body = frame.body.clone();
            body.reverse();
            Frame::response(frame.correlation, ErrorKind::Ok.code(), body)
                .write_to(&mut stream)
                .unwrap();
            // Drain until the client disconnects.
            while Frame::read_from(&mut stream).is_ok() {}
        });

        let transport = ClientTransport::new();
        let handle = transport
            .connect(&path, ServiceId::new(1), small_sizing())
            .unwrap();

        let mut response = [0u8; 64];
        let len = transport
            .request_response(
                handle,
                MessageId::new(1),
                b"0123456789abcdef",
                &mut response,
                Some(Duration::from_secs(5)),
            )
            .unwrap();
        assert_eq!(&response[..len], b"fedcba9876543210");

        transport.disconnect(handle).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_connect_rejected_not_supported() {
        let (_dir, path) = endpoint();
        let listener = UnixListener::bind(&path).unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let _request: ConnectRequest = read_handshake(&mut stream).unwrap();
            write_handshake(
                &mut stream,
                &ConnectResponse::rejected(ErrorKind::NotSupported),
            )
            .unwrap();
        });

        let transport = ClientTransport::new();
        let result = transport.connect(&path, ServiceId::new(99), small_sizing());
        assert_eq!(result.unwrap_err(), ErrorKind::NotSupported);
        server.join().unwrap();
    }

    #[test]
    fn test_connect_endpoint_name_too_long() {
        let transport = ClientTransport::new();
        let long = format!("/tmp/{}", "a".repeat(150));
        let result = transport.connect(&long, ServiceId::new(1), small_sizing());
        assert_eq!(result.unwrap_err(), ErrorKind::NameTooLong);
    }

    #[test]
    fn test_connect_missing_endpoint() {
        let (_dir, path) = endpoint();
        let transport = ClientTransport::new();
        let result = transport.connect(&path, ServiceId::new(1), small_sizing());
        assert_eq!(result.unwrap_err(), ErrorKind::NotFound);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let (_dir, path) = endpoint();
        let listener = UnixListener::bind(&path).unwrap();
        let server = thread::spawn(move || {
            let mut stream = accept_service(&listener);
            while Frame::read_from(&mut stream).is_ok() {}
        });

        let transport = ClientTransport::new();
        let handle = transport
            .connect(&path, ServiceId::new(1), small_sizing())
            .unwrap();

        assert_eq!(transport.disconnect(handle), Ok(()));
        assert_eq!(transport.disconnect(handle), Ok(()));
        server.join().unwrap();
    }

    #[test]
    fn test_request_timeout() {
        let (_dir, path) = endpoint();
        let listener = UnixListener::bind(&path).unwrap();
        let server = thread::spawn(move || {
            let mut stream = accept_service(&listener);
            // Never answer; hold the socket open past the client timeout.
            let _ = Frame::read_from(&mut stream);
            thread::sleep(Duration::from_millis(300));
        });

        let transport = ClientTransport::new();
        let handle = transport
            .connect(&path, ServiceId::new(1), small_sizing())
            .unwrap();

        let mut response = [0u8; 16];
        let result = transport.request_response(
            handle,
            MessageId::new(1),
            b"ping",
            &mut response,
            Some(Duration::from_millis(50)),
        );
        assert_eq!(result.unwrap_err(), ErrorKind::Timeout);

        transport.disconnect(handle).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_dispatch_and_flow_control_routing() {
        let (_dir, path) = endpoint();
        let listener = UnixListener::bind(&path).unwrap();
        let server = thread::spawn(move || {
            let mut stream = accept_service(&listener);
            let frame = Frame::read_from(&mut stream).unwrap();
            // Dispatch event and throttle notice land before the reply.
            Frame::dispatch(b"event-1".to_vec())
                .write_to(&mut stream)
                .unwrap();
            Frame::flow_control(FlowControlState::Enabled)
                .write_to(&mut stream)
                .unwrap();
            Frame::response(frame.correlation, ErrorKind::Ok.code(), b"done".to_vec())
                .write_to(&mut stream)
                .unwrap();
            while Frame::read_from(&mut stream).is_ok() {}
        });

        let transport = ClientTransport::new();
        let handle = transport
            .connect(&path, ServiceId::new(1), small_sizing())
            .unwrap();

        let mut response = [0u8; 16];
        let len = transport
            .request_response(
                handle,
                MessageId::new(1),
                b"go",
                &mut response,
                Some(Duration::from_secs(5)),
            )
            .unwrap();
        assert_eq!(&response[..len], b"done");

        // Both out-of-band frames were routed while waiting.
        assert_eq!(
            transport.dispatch_flow_control_get(handle).unwrap(),
            FlowControlState::Enabled
        );
        let event = transport
            .dispatch_get(handle, Some(Duration::from_secs(1)))
            .unwrap()
            .expect("event should be queued");
        assert_eq!(event, b"event-1");
        transport.dispatch_put(handle).unwrap();

        // Throttled: the next request fails fast instead of blocking.
        let result = transport.request_response(
            handle,
            MessageId::new(1),
            b"more",
            &mut response,
            Some(Duration::from_secs(1)),
        );
        assert_eq!(result.unwrap_err(), ErrorKind::TryAgain);

        transport.disconnect(handle).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_dispatch_get_nonblocking_poll() {
        let (_dir, path) = endpoint();
        let listener = UnixListener::bind(&path).unwrap();
        let server = thread::spawn(move || {
            let mut stream = accept_service(&listener);
            while Frame::read_from(&mut stream).is_ok() {}
        });

        let transport = ClientTransport::new();
        let handle = transport
            .connect(&path, ServiceId::new(1), small_sizing())
            .unwrap();

        assert_eq!(
            transport.dispatch_get(handle, Some(Duration::ZERO)).unwrap(),
            None
        );

        transport.disconnect(handle).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_zero_timeout_poll_surfaces_buffered_event() {
        let (_dir, path) = endpoint();
        let listener = UnixListener::bind(&path).unwrap();
        let server = thread::spawn(move || {
            let mut stream = accept_service(&listener);
            Frame::dispatch(b"poll-me".to_vec())
                .write_to(&mut stream)
                .unwrap();
            while Frame::read_from(&mut stream).is_ok() {}
        });

        let transport = ClientTransport::new();
        let handle = transport
            .connect(&path, ServiceId::new(1), small_sizing())
            .unwrap();

        // The zero-timeout poll never blocks, but once the event reaches
        // the socket buffer it must surface it.
        let deadline = Instant::now() + Duration::from_secs(2);
        let event = loop {
            if let Some(event) = transport.dispatch_get(handle, Some(Duration::ZERO)).unwrap() {
                break event;
            }
            assert!(Instant::now() < deadline, "buffered event never surfaced");
            thread::yield_now();
        };
        assert_eq!(event, b"poll-me");
        transport.dispatch_put(handle).unwrap();

        transport.disconnect(handle).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_in_buf_reply() {
        let (_dir, path) = endpoint();
        let listener = UnixListener::bind(&path).unwrap();
        let server = thread::spawn(move || {
            let mut stream = accept_service(&listener);
            let frame = Frame::read_from(&mut stream).unwrap();
            Frame::response(frame.correlation, ErrorKind::Ok.code(), frame.body)
                .write_to(&mut stream)
                .unwrap();
            while Frame::read_from(&mut stream).is_ok() {}
        });

        let transport = ClientTransport::new();
        let handle = transport
            .connect(&path, ServiceId::new(1), small_sizing())
            .unwrap();

        let reply = transport
            .request_response_in_buf(
                handle,
                MessageId::new(7),
                b"stay-put",
                Some(Duration::from_secs(5)),
            )
            .unwrap();
        assert_eq!(&*reply.bytes(), b"stay-put");
        drop(reply);

        transport.disconnect(handle).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_zcb_accounting_and_send() {
        let (_dir, path) = endpoint();
        let listener = UnixListener::bind(&path).unwrap();
        let server = thread::spawn(move || {
            let mut stream = accept_service(&listener);
            let frame = Frame::read_from(&mut stream).unwrap();
            let mut body = frame.body.clone();
            body.reverse();
            Frame::response(frame.correlation, ErrorKind::Ok.code(), body)
                .write_to(&mut stream)
                .unwrap();
            while Frame::read_from(&mut stream).is_ok() {}
        });

        let transport = ClientTransport::new();
        let handle = transport
            .connect(&path, ServiceId::new(1), small_sizing())
            .unwrap();

        // Alloc followed by free leaves the pool unchanged.
        let buffer = transport.zcb_alloc(handle, 128).unwrap();
        assert_eq!(transport.zcb_allocated(handle).unwrap(), 128);
        transport.zcb_free(handle, buffer).unwrap();
        assert_eq!(transport.zcb_allocated(handle).unwrap(), 0);

        let mut buffer = transport.zcb_alloc(handle, 4).unwrap();
        buffer.copy_from_slice(b"wxyz");
        let mut response = [0u8; 16];
        let len = transport
            .zcb_send_reply_receive(
                handle,
                MessageId::new(2),
                &buffer,
                &mut response,
                Some(Duration::from_secs(5)),
            )
            .unwrap();
        assert_eq!(&response[..len], b"zyxw");
        transport.zcb_free(handle, buffer).unwrap();

        transport.disconnect(handle).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_context_round_trip() {
        let (_dir, path) = endpoint();
        let listener = UnixListener::bind(&path).unwrap();
        let server = thread::spawn(move || {
            let mut stream = accept_service(&listener);
            while Frame::read_from(&mut stream).is_ok() {}
        });

        let transport = ClientTransport::new();
        let handle = transport
            .connect(&path, ServiceId::new(1), small_sizing())
            .unwrap();

        assert_eq!(transport.context_get(handle).unwrap(), 0);
        transport.context_set(handle, 0xdead_beef).unwrap();
        assert_eq!(transport.context_get(handle).unwrap(), 0xdead_beef);

        transport.disconnect(handle).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_operations_after_disconnect_fail_with_bad_handle() {
        let (_dir, path) = endpoint();
        let listener = UnixListener::bind(&path).unwrap();
        let server = thread::spawn(move || {
            let mut stream = accept_service(&listener);
            while Frame::read_from(&mut stream).is_ok() {}
        });

        let transport = ClientTransport::new();
        let handle = transport
            .connect(&path, ServiceId::new(1), small_sizing())
            .unwrap();
        transport.disconnect(handle).unwrap();

        let mut response = [0u8; 16];
        assert_eq!(
            transport
                .request_response(handle, MessageId::new(1), b"x", &mut response, None)
                .unwrap_err(),
            ErrorKind::BadHandle
        );
        assert_eq!(
            transport.dispatch_flow_control_get(handle).unwrap_err(),
            ErrorKind::BadHandle
        );
        server.join().unwrap();
    }
}
