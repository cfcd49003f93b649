//! Pipe item protocol.
//!
//! A pipe item is an opaque unit of outbound work queued on a
//! [`ChannelClient`](crate::channel_client::ChannelClient)'s pipe. The core
//! never interprets the payload — only the channel implementation that
//! produced it knows how to serialize it in `send_item`. This module only
//! defines the interface the core needs: a type tag (so `pipes_add_type`/
//! `pipes_add_empty_msg` can construct placeholder items without knowing the
//! concrete type) and the bare marker trait object channels push around.

use std::fmt;

/// A typed, opaque outbound work unit.
///
/// Concrete channel implementations define their own item types and box them
/// behind this trait; the core only ever moves `Box<dyn PipeItem>` values
/// around, calling [`Channel::send_item`](crate::channel::ChannelCallbacks::send_item)
/// to actually drain one onto the wire.
pub trait PipeItem: Send + fmt::Debug {
    /// The wire/message type tag for this item, as the owning channel defines it.
    fn kind(&self) -> u32;
}

/// A typed item carrying no payload, used by `pipes_add_type`/
/// `pipes_add_empty_msg` to enqueue a marker without invoking a channel's
/// item constructor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmptyItem {
    kind: u32,
}

impl EmptyItem {
    pub fn new(kind: u32) -> Self {
        Self { kind }
    }
}

impl PipeItem for EmptyItem {
    fn kind(&self) -> u32 {
        self.kind
    }
}

/// Callback used by `pipes_new_add`/`_add_tail`/`_add_push`: given a
/// channel-client, caller-supplied data, and the channel-client's index in
/// the fan-out, produce an item to enqueue (or `None` to skip this
/// channel-client).
pub type PipeItemCreator<'a, CC, D> = dyn Fn(&CC, &D, usize) -> Option<Box<dyn PipeItem>> + 'a;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_item_reports_its_type() {
        let item = EmptyItem::new(7);
        assert_eq!(item.kind(), 7);
    }
}
