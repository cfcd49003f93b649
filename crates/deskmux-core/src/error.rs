//! Error types for the channel/client core and its WebSocket transport.

use thiserror::Error;

/// Errors surfaced by the [`crate::websocket::WebSocketTransport`].
#[derive(Debug, Error)]
pub enum WebSocketError {
    /// The opening handshake buffer did not look like a WebSocket upgrade
    /// request (missing `GET`, `Sec-WebSocket-Key`, or the `binary`
    /// sub-protocol), or the handshake response could not be written in full.
    #[error("websocket handshake rejected")]
    HandshakeRejected,

    /// A framing rule from RFC 6455 was violated (reserved bits set, a
    /// fragmented control frame, an unknown opcode, or an oversize control
    /// frame). The connection is unrecoverable once this occurs.
    #[error("websocket protocol violation: {0}")]
    Protocol(&'static str),

    /// The connection is already closed.
    #[error("websocket connection closed")]
    Closed,

    /// The underlying raw stream returned an I/O error.
    #[error("websocket i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by [`crate::client::Client`] migration operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// `semi_seamless_migrate_complete` was called while the client was not
    /// in the `SemiSeamlessTarget` migration state. Mirrors the C source's
    /// `spice_error("unexpected")` path: logged, not fatal.
    #[error("semi-seamless migration complete called outside SemiSeamlessTarget state")]
    UnexpectedState,
}

/// Errors surfaced by [`crate::channel::Channel`]'s connect path.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// `client_cbs.connect` was never overridden by the concrete channel
    /// type. Matches the default `red_channel_client_connect` that fails
    /// with "not implemented" unless a subclass registers its own.
    #[error("channel connect not implemented")]
    ConnectNotImplemented,
}
