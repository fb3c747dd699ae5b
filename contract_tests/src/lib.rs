//! # Transport Contract Tests
//!
//! This crate provides "golden" tests for the transport contract to
//! ensure it doesn't drift accidentally over time.
//!
//! ## Philosophy
//!
//! - **Explicit over implicit**: the wire contract is written as code
//! - **Testability first**: contract tests fail when the contract changes
//! - **Real sockets**: scenario tests run full client/server pairs over
//!   filesystem endpoints, not mocks
//!
//! ## Structure
//!
//! - `error_codes` pins the stable result-code table
//! - `lifecycle` covers connect/disconnect and handle validity
//! - `messaging` covers request/response and zero-copy transfer
//! - `dispatch_flow` covers dispatch delivery and flow control

pub mod dispatch_flow;
pub mod error_codes;
pub mod lifecycle;
pub mod messaging;

pub mod test_helpers;
