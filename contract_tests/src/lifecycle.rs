//! Connection lifecycle contract
//!
//! Teardown is idempotent, dead handles stay dead, and an endpoint
//! outlives any single connection.

#[cfg(test)]
mod tests {
    use crate::test_helpers::*;
    use ipc_client::ClientTransport;
    use ipc_core::{ErrorKind, ServiceId};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_double_disconnect_is_ok() {
        let (_dir, path) = socket_path();
        let server = bind_echo(&path);
        let server_side = serve_one(Arc::clone(&server));

        let client = ClientTransport::new();
        let handle = client.connect(&path, ECHO_SERVICE, test_sizing()).unwrap();

        assert_eq!(client.disconnect(handle), Ok(()));
        assert_eq!(client.disconnect(handle), Ok(()));
        server_side.join().unwrap();
    }

    #[test]
    fn test_dead_handle_rejected_everywhere() {
        let (_dir, path) = socket_path();
        let server = bind_echo(&path);
        let server_side = serve_one(Arc::clone(&server));

        let client = ClientTransport::new();
        let handle = client.connect(&path, ECHO_SERVICE, test_sizing()).unwrap();
        client.disconnect(handle).unwrap();
        server_side.join().unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(
            client
                .request_response(handle, MSG_ECHO_REVERSED, b"x", &mut buf, None)
                .unwrap_err(),
            ErrorKind::BadHandle
        );
        assert_eq!(
            client.dispatch_get(handle, Some(Duration::ZERO)).unwrap_err(),
            ErrorKind::BadHandle
        );
        assert_eq!(
            client.dispatch_flow_control_get(handle).unwrap_err(),
            ErrorKind::BadHandle
        );
        assert_eq!(client.context_get(handle).unwrap_err(), ErrorKind::BadHandle);
        assert_eq!(
            client.zcb_alloc(handle, 64).unwrap_err(),
            ErrorKind::BadHandle
        );
    }

    #[test]
    fn test_endpoint_serves_sequential_connections() {
        let (_dir, path) = socket_path();
        let server = bind_echo(&path);
        let client = ClientTransport::new();

        for round in 0..2u8 {
            let server_side = serve_one(Arc::clone(&server));
            let handle = client.connect(&path, ECHO_SERVICE, test_sizing()).unwrap();

            let mut buf = [0u8; 16];
            let len = client
                .request_response(
                    handle,
                    MSG_ECHO_REVERSED,
                    &[round, round + 1],
                    &mut buf,
                    Some(Duration::from_secs(5)),
                )
                .unwrap();
            assert_eq!(&buf[..len], &[round + 1, round]);

            client.disconnect(handle).unwrap();
            server_side.join().unwrap();
        }
        assert!(server.active_connections().is_empty());
    }

    #[test]
    fn test_unknown_service_refused() {
        let (_dir, path) = socket_path();
        let server = bind_echo(&path);
        let server_side = {
            let server = Arc::clone(&server);
            std::thread::spawn(move || server.handle_accept())
        };

        let client = ClientTransport::new();
        let result = client.connect(&path, ServiceId::new(42), test_sizing());
        assert_eq!(result.unwrap_err(), ErrorKind::NotSupported);
        assert!(server_side.join().unwrap().is_err());
    }

    #[test]
    fn test_context_slot_is_per_connection() {
        let (_dir, path) = socket_path();
        let server = bind_echo(&path);
        let first_side = serve_one(Arc::clone(&server));

        let client = ClientTransport::new();
        let first = client.connect(&path, ECHO_SERVICE, test_sizing()).unwrap();
        client.context_set(first, 7).unwrap();

        let second_side = serve_one(Arc::clone(&server));
        let second = client.connect(&path, ECHO_SERVICE, test_sizing()).unwrap();
        assert_eq!(client.context_get(second).unwrap(), 0);
        assert_eq!(client.context_get(first).unwrap(), 7);

        client.disconnect(first).unwrap();
        client.disconnect(second).unwrap();
        first_side.join().unwrap();
        second_side.join().unwrap();
    }
}
