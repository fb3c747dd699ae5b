//! Shared harness: an echo service served over a temporary endpoint.

use ipc_core::handshake::ChannelSizing;
use ipc_core::{ErrorKind, MessageId, ServiceId};
use ipc_server::{
    Handle, HandlerResult, NullPollHooks, RequestContext, ServerTransport, ServiceHandlers,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Service offered by the test harness.
pub const ECHO_SERVICE: ServiceId = ServiceId::new(1);

/// Replies with the request bytes reversed.
pub const MSG_ECHO_REVERSED: MessageId = MessageId::new(1);

/// Always fails with `NotFound`.
pub const MSG_FAIL: MessageId = MessageId::new(2);

/// Minimal handler table behind the scenarios.
pub struct EchoHandlers;

impl ServiceHandlers for EchoHandlers {
    fn service_available(&self, service: ServiceId) -> bool {
        service == ECHO_SERVICE
    }

    fn handle(
        &self,
        _ctx: &RequestContext,
        message: MessageId,
        payload: &[u8],
    ) -> Result<HandlerResult, ErrorKind> {
        match message {
            MSG_ECHO_REVERSED => {
                let mut body = payload.to_vec();
                body.reverse();
                Ok(HandlerResult::Reply(body))
            }
            MSG_FAIL => Err(ErrorKind::NotFound),
            _ => Err(ErrorKind::InvalidParam),
        }
    }
}

/// Fresh socket path; keep the TempDir alive for the test's duration.
pub fn socket_path() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("ipc.sock");
    (dir, path)
}

/// Binds the echo service on `path`.
pub fn bind_echo(path: &Path) -> Arc<ServerTransport> {
    Arc::new(
        ServerTransport::bind(path, Arc::new(EchoHandlers), Arc::new(NullPollHooks))
            .expect("bind"),
    )
}

/// Serves one connection to completion on a background thread.
pub fn serve_one(server: Arc<ServerTransport>) -> JoinHandle<Handle> {
    thread::spawn(move || {
        let handle = server.handle_accept().expect("accept");
        while let Ok(true) = server.handle_connection_readable(handle) {}
        handle
    })
}

/// Sizing used by most scenarios.
pub fn test_sizing() -> ChannelSizing {
    ChannelSizing {
        request_size: 256,
        response_size: 256,
        dispatch_size: 256,
        dispatch_slots: 6,
    }
}

/// Smallest legal sizing; two slots of dispatch capacity.
pub fn tight_sizing() -> ChannelSizing {
    ChannelSizing {
        request_size: 128,
        response_size: 128,
        dispatch_size: 128,
        dispatch_slots: 4,
    }
}
