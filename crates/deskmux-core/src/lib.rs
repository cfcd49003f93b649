//! Channel/client fan-out core and RFC 6455 WebSocket transport for a
//! multiplexed remote-desktop server.
//!
//! This crate owns the subsystem described as "the hard parts" of the
//! server: a registry of channels and clients connected by channel-clients,
//! reference-counted destruction safe under re-entry from message handlers,
//! a two-phase migration protocol, and the byte-exact WebSocket framing
//! transport underneath it. Per-channel business logic (display, cursor,
//! inputs), the application-layer message parser, the event loop, and
//! statistics sinks are external collaborators reached through the trait
//! seams in [`channel`] and [`pipe_item`].

pub mod capability;
pub mod channel;
pub mod channel_client;
pub mod client;
pub mod error;
pub mod pipe_item;
pub mod websocket;

pub use capability::{Bitmap, CapabilitySet};
pub use channel::{Channel, ChannelCallbacks, ChannelStats, ClientCallbacks};
pub use channel_client::{ChannelClient, ClientStream};
pub use client::{Client, MigrationState, MigrationSupervisor};
pub use error::{ChannelError, MigrationError, WebSocketError};
pub use pipe_item::{EmptyItem, PipeItem, PipeItemCreator};
pub use websocket::WebSocketTransport;
