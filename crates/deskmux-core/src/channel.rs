//! Abstract channel: the fan-out core over a set of connected channel-clients.

use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::capability::{CapabilitySet, CAP_MINI_HEADER};
use crate::channel_client::{ChannelClient, ClientStream};
use crate::client::Client;
use crate::error::ChannelError;
use crate::pipe_item::{PipeItem, PipeItemCreator};

/// Poll interval for [`Channel::wait_all_sent`]'s drain loop.
const CHANNEL_BLOCKED_SLEEP_DURATION: Duration = Duration::from_millis(10);

/// Migration-flag bit: this channel type requires a data blob transfer
/// during seamless migration (gates whether `handle_migrate_data` must be
/// supplied at construction).
pub const MIGRATE_NEEDS_DATA_TRANSFER: u32 = 1 << 0;

/// Migration-flag bit: this channel type needs a flush-mark round trip
/// before migration data is sent.
pub const MIGRATE_NEEDS_FLUSH_MARK: u32 = 1 << 1;

/// Class-level callbacks a concrete channel type supplies. Methods that are
/// always required (matching `red_channel_constructed`'s unconditional
/// `spice_assert`) are plain trait methods — Rust's trait system rejects an
/// implementation missing one at compile time, which is the exact validation
/// the original performs at runtime. `handle_migrate_data` is conditionally
/// required and is therefore not part of this trait; see
/// [`Channel::new`].
pub trait ChannelCallbacks: Send + Sync {
    fn config_socket(&self, cc: &Arc<ChannelClient>) -> bool;
    fn on_disconnect(&self, cc: &Arc<ChannelClient>);
    fn alloc_recv_buf(&self, cc: &Arc<ChannelClient>, msg_type: u32, size: usize) -> Vec<u8>;
    fn release_recv_buf(&self, cc: &Arc<ChannelClient>, msg_type: u32, buf: Vec<u8>);
    fn send_item(&self, cc: &Arc<ChannelClient>, item: &dyn PipeItem);
    fn handle_message(&self, cc: &Arc<ChannelClient>, msg_type: u32, buf: &[u8]) -> bool;

    /// Default accepts whatever `handle_message` already decided.
    fn handle_parsed(&self, _cc: &Arc<ChannelClient>, _size: usize, _msg_type: u32) -> bool {
        true
    }

    /// Selects which parser the caller's message-handling code should use.
    /// The parser itself is an external collaborator (out of scope); this
    /// is only the seam.
    fn parser_kind(&self) -> u32 {
        0
    }

    fn handle_migrate_flush_mark(&self, _cc: &Arc<ChannelClient>) {}
}

/// User-registered callbacks invoked by the channel on connect/disconnect/
/// migrate, matching `red_channel_register_client_cbs`.
pub trait ClientCallbacks: Send + Sync {
    fn connect(
        &self,
        _channel: &Arc<Channel>,
        _client: &Arc<Client>,
        _stream: Box<dyn ClientStream>,
        _during_target_migrate: bool,
        _common_caps: &[u32],
        _caps: &[u32],
    ) -> Result<Arc<ChannelClient>, ChannelError> {
        Err(ChannelError::ConnectNotImplemented)
    }

    fn disconnect(&self, cc: &Arc<ChannelClient>) {
        cc.disconnect();
    }

    fn migrate(&self, cc: &Arc<ChannelClient>) {
        cc.migrate();
    }
}

/// Seam for a statistics sink (out of scope to implement; matches the
/// `RED_STATISTICS`-gated counter in `red_channel_on_output`).
pub trait ChannelStats: Send + Sync {
    fn on_output(&self, bytes: usize);
}

struct ChannelState {
    caps: CapabilitySet,
    clients: Vec<Arc<ChannelClient>>,
    owner_thread: ThreadId,
}

/// A typed stream endpoint (main, display, inputs, cursor, ...) owning the
/// set of currently-connected channel-clients and dispatching fan-out
/// operations across them.
pub struct Channel {
    channel_type: u32,
    id: u32,
    handle_acks: bool,
    migration_flags: u32,
    callbacks: Box<dyn ChannelCallbacks>,
    client_callbacks: Box<dyn ClientCallbacks>,
    handle_migrate_data: Option<Box<dyn Fn(&Arc<ChannelClient>, &[u8]) + Send + Sync>>,
    stats: Option<Box<dyn ChannelStats>>,
    state: Mutex<ChannelState>,
}

impl Channel {
    /// `handle_migrate_data` must be `Some` iff `migration_flags` sets
    /// [`MIGRATE_NEEDS_DATA_TRANSFER`] — the one conditionally-required
    /// callback the trait can't enforce at compile time.
    pub fn new(
        channel_type: u32,
        id: u32,
        handle_acks: bool,
        migration_flags: u32,
        callbacks: Box<dyn ChannelCallbacks>,
        client_callbacks: Box<dyn ClientCallbacks>,
        handle_migrate_data: Option<Box<dyn Fn(&Arc<ChannelClient>, &[u8]) + Send + Sync>>,
    ) -> Arc<Self> {
        let needs_data_transfer = migration_flags & MIGRATE_NEEDS_DATA_TRANSFER != 0;
        assert_eq!(
            handle_migrate_data.is_some(),
            needs_data_transfer,
            "handle_migrate_data must be supplied iff migration_flags requests data transfer"
        );

        let mut caps = CapabilitySet::new();
        caps.set_common(CAP_MINI_HEADER);

        Arc::new(Self {
            channel_type,
            id,
            handle_acks,
            migration_flags,
            callbacks,
            client_callbacks,
            handle_migrate_data,
            stats: None,
            state: Mutex::new(ChannelState {
                caps,
                clients: Vec::new(),
                owner_thread: thread::current().id(),
            }),
        })
    }

    pub fn channel_type(&self) -> u32 {
        self.channel_type
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn handle_acks(&self) -> bool {
        self.handle_acks
    }

    pub fn migration_flags(&self) -> u32 {
        self.migration_flags
    }

    pub fn callbacks(&self) -> &dyn ChannelCallbacks {
        self.callbacks.as_ref()
    }

    pub fn client_callbacks(&self) -> &dyn ClientCallbacks {
        self.client_callbacks.as_ref()
    }

    pub fn handle_migrate_data(&self, cc: &Arc<ChannelClient>, data: &[u8]) {
        if let Some(handler) = &self.handle_migrate_data {
            handler(cc, data);
        }
    }

    pub fn set_stats(&mut self, stats: Box<dyn ChannelStats>) {
        self.stats = Some(stats);
    }

    pub fn set_common_cap(&self, cap: u32) {
        self.state.lock().unwrap().caps.set_common(cap);
    }

    pub fn set_cap(&self, cap: u32) {
        self.state.lock().unwrap().caps.set(cap);
    }

    /// Rebinds the owner thread to the currently-executing thread.
    pub fn rebind_owner_thread(&self) {
        self.state.lock().unwrap().owner_thread = thread::current().id();
    }

    fn is_owner_thread(&self) -> bool {
        self.state.lock().unwrap().owner_thread == thread::current().id()
    }

    fn snapshot(&self) -> Vec<Arc<ChannelClient>> {
        self.state.lock().unwrap().clients.clone()
    }

    /// Must run on `thread_id`; violating this is a programmer error
    /// (`debug_assert!`), distinct from `remove_client`'s documented lenient
    /// cross-thread behavior.
    pub fn add_client(&self, cc: Arc<ChannelClient>) {
        debug_assert!(self.is_owner_thread(), "add_client must run on the channel's owner thread");
        debug_assert!(
            std::ptr::eq(Arc::as_ptr(cc.channel()), self),
            "add_client called with a channel-client belonging to a different channel"
        );
        self.state.lock().unwrap().clients.push(cc);
    }

    /// Warns (but proceeds) on a cross-thread call, and asserts the
    /// channel-client is actually linked before unlinking — mirrors
    /// `red_channel_remove_client`'s `g_list_find` + `g_return_if_fail`
    /// pattern exactly.
    pub fn remove_client(&self, cc: &Arc<ChannelClient>) {
        if !self.is_owner_thread() {
            tracing::warn!("remove_client invoked off the channel's owner thread; proceeding anyway");
        }
        let mut state = self.state.lock().unwrap();
        match state.clients.iter().position(|existing| Arc::ptr_eq(existing, cc)) {
            Some(idx) => {
                state.clients.remove(idx);
            }
            None => {
                debug_assert!(false, "remove_client called for a channel-client not in the connected list");
            }
        }
    }

    pub fn connect(
        self: &Arc<Self>,
        client: &Arc<Client>,
        stream: Box<dyn ClientStream>,
        during_target_migrate: bool,
        common_caps: &[u32],
        caps: &[u32],
    ) -> Result<Arc<ChannelClient>, ChannelError> {
        self.client_callbacks
            .connect(self, client, stream, during_target_migrate, common_caps, caps)
    }

    pub fn receive(&self) {
        for cc in self.snapshot() {
            let _ = cc.receive();
        }
    }

    pub fn send(&self) {
        for cc in self.snapshot() {
            cc.send();
        }
    }

    pub fn push(&self) {
        for cc in self.snapshot() {
            cc.push();
        }
    }

    pub fn disconnect(&self) {
        for cc in self.snapshot() {
            cc.disconnect();
        }
    }

    pub fn init_outgoing_messages_window(&self) {
        for cc in self.snapshot() {
            cc.init_outgoing_messages_window();
        }
    }

    /// Construct a typed empty item and enqueue it (tail) on every
    /// connected channel-client.
    pub fn pipes_add_type(&self, msg_type: u32) {
        for cc in self.snapshot() {
            cc.pipe_add_tail(Box::new(crate::pipe_item::EmptyItem::new(msg_type)));
        }
    }

    /// As [`Channel::pipes_add_type`], but also pushes immediately.
    pub fn pipes_add_empty_msg(&self, msg_type: u32) {
        for cc in self.snapshot() {
            cc.pipe_add_tail(Box::new(crate::pipe_item::EmptyItem::new(msg_type)));
            cc.push();
        }
    }

    fn pipes_new_add_inner<D>(
        &self,
        data: &D,
        creator: &PipeItemCreator<'_, ChannelClient, D>,
        tail: bool,
        push: bool,
    ) -> usize {
        let mut count = 0;
        for (index, cc) in self.snapshot().into_iter().enumerate() {
            if let Some(item) = creator(cc.as_ref(), data, index) {
                if tail {
                    cc.pipe_add_tail(item);
                } else {
                    cc.pipe_add(item);
                }
                if push {
                    cc.push();
                }
                count += 1;
            }
        }
        count
    }

    /// Invoke `creator(cc, data, index)` per connected channel-client;
    /// enqueue at the head when it returns an item. Returns the number of
    /// non-`None` items produced.
    pub fn pipes_new_add<D>(&self, data: &D, creator: &PipeItemCreator<'_, ChannelClient, D>) -> usize {
        self.pipes_new_add_inner(data, creator, false, false)
    }

    pub fn pipes_new_add_tail<D>(&self, data: &D, creator: &PipeItemCreator<'_, ChannelClient, D>) -> usize {
        self.pipes_new_add_inner(data, creator, true, false)
    }

    pub fn pipes_new_add_push<D>(&self, data: &D, creator: &PipeItemCreator<'_, ChannelClient, D>) -> usize {
        self.pipes_new_add_inner(data, creator, true, true)
    }

    pub fn all_blocked(&self) -> bool {
        self.state.lock().unwrap().clients.iter().all(|cc| cc.is_blocked())
    }

    pub fn any_blocked(&self) -> bool {
        self.state.lock().unwrap().clients.iter().any(|cc| cc.is_blocked())
    }

    pub fn no_item_being_sent(&self) -> bool {
        self.state.lock().unwrap().clients.iter().all(|cc| !cc.is_blocked())
    }

    pub fn max_pipe_size(&self) -> usize {
        self.state.lock().unwrap().clients.iter().map(|cc| cc.pipe_size()).max().unwrap_or(0)
    }

    pub fn min_pipe_size(&self) -> usize {
        self.state.lock().unwrap().clients.iter().map(|cc| cc.pipe_size()).min().unwrap_or(0)
    }

    pub fn sum_pipes_size(&self) -> usize {
        self.state.lock().unwrap().clients.iter().map(|cc| cc.pipe_size()).sum()
    }

    pub fn get_n_clients(&self) -> usize {
        self.state.lock().unwrap().clients.len()
    }

    #[cfg(unix)]
    pub fn get_first_socket(&self) -> i32 {
        self.state.lock().unwrap().clients.first().map(|cc| cc.raw_fd()).unwrap_or(-1)
    }

    #[cfg(not(unix))]
    pub fn get_first_socket(&self) -> i32 {
        -1
    }

    pub fn is_connected(&self) -> bool {
        !self.state.lock().unwrap().clients.is_empty()
    }

    pub fn test_remote_common_cap(&self, cap: u32) -> bool {
        self.state.lock().unwrap().clients.iter().all(|cc| cc.test_remote_common_cap(cap))
    }

    pub fn test_remote_cap(&self, cap: u32) -> bool {
        self.state.lock().unwrap().clients.iter().all(|cc| cc.test_remote_cap(cap))
    }

    /// Defined only when exactly one channel-client is connected; false
    /// otherwise.
    pub fn is_waiting_for_migrate_data(&self) -> bool {
        let state = self.state.lock().unwrap();
        match state.clients.as_slice() {
            [only] => only.is_migration_seamless(),
            _ => false,
        }
    }

    /// Repeatedly push/receive/send while anything is queued or any
    /// channel-client is blocked, sleeping between iterations.
    /// `timeout_ns == -1` waits forever.
    pub fn wait_all_sent(&self, timeout_ns: i64) -> bool {
        let deadline = (timeout_ns >= 0).then(|| Instant::now() + Duration::from_nanos(timeout_ns as u64));
        loop {
            self.push();
            self.receive();
            self.send();
            if self.sum_pipes_size() == 0 && self.no_item_being_sent() {
                return true;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return false;
                }
            }
            thread::sleep(CHANNEL_BLOCKED_SLEEP_DURATION);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel_client::ChannelClient;
    use crate::client::Client;
    use std::io::{Read, Write};

    struct NullStream;
    impl Read for NullStream {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Ok(0)
        }
    }
    impl Write for NullStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
    #[cfg(unix)]
    impl std::os::fd::AsRawFd for NullStream {
        fn as_raw_fd(&self) -> std::os::fd::RawFd {
            -1
        }
    }

    struct CountingCallbacks {
        sent: Mutex<u32>,
    }
    impl ChannelCallbacks for CountingCallbacks {
        fn config_socket(&self, _cc: &Arc<ChannelClient>) -> bool {
            true
        }
        fn on_disconnect(&self, _cc: &Arc<ChannelClient>) {}
        fn alloc_recv_buf(&self, _cc: &Arc<ChannelClient>, _msg_type: u32, size: usize) -> Vec<u8> {
            vec![0; size]
        }
        fn release_recv_buf(&self, _cc: &Arc<ChannelClient>, _msg_type: u32, _buf: Vec<u8>) {}
        fn send_item(&self, _cc: &Arc<ChannelClient>, _item: &dyn PipeItem) {
            *self.sent.lock().unwrap() += 1;
        }
        fn handle_message(&self, _cc: &Arc<ChannelClient>, _msg_type: u32, _buf: &[u8]) -> bool {
            true
        }
    }

    struct DefaultClientCallbacks;
    impl ClientCallbacks for DefaultClientCallbacks {}

    fn channel_with(callbacks: CountingCallbacks) -> Arc<Channel> {
        Channel::new(1, 0, false, 0, Box::new(callbacks), Box::new(DefaultClientCallbacks), None)
    }

    fn attach_client(channel: &Arc<Channel>) -> Arc<ChannelClient> {
        let client = Client::new(false, None);
        let cc = ChannelClient::new(channel.clone(), client.clone(), Box::new(NullStream));
        channel.add_client(cc.clone());
        client.add_channel(cc.clone());
        cc
    }

    #[test]
    fn channel_sets_mini_header_capability_on_construction() {
        let channel = channel_with(CountingCallbacks { sent: Mutex::new(0) });
        assert!(channel.state.lock().unwrap().caps.test_common(CAP_MINI_HEADER));
    }

    #[test]
    fn construction_panics_if_migrate_data_flag_mismatches_handler() {
        let result = std::panic::catch_unwind(|| {
            Channel::new(
                1,
                0,
                false,
                MIGRATE_NEEDS_DATA_TRANSFER,
                Box::new(CountingCallbacks { sent: Mutex::new(0) }),
                Box::new(DefaultClientCallbacks),
                None,
            )
        });
        assert!(result.is_err());
    }

    #[test]
    fn aggregates_are_vacuously_true_or_zero_when_empty() {
        let channel = channel_with(CountingCallbacks { sent: Mutex::new(0) });
        assert!(channel.all_blocked());
        assert!(!channel.any_blocked());
        assert!(channel.no_item_being_sent());
        assert_eq!(channel.min_pipe_size(), 0);
        assert_eq!(channel.max_pipe_size(), 0);
        assert_eq!(channel.sum_pipes_size(), 0);
        assert_eq!(channel.get_first_socket(), -1);
        assert!(!channel.is_connected());
        assert!(channel.test_remote_cap(5));
        assert!(channel.test_remote_common_cap(5));
    }

    #[test]
    fn pipes_add_type_then_push_delivers_exactly_one_item_per_client() {
        let channel = channel_with(CountingCallbacks { sent: Mutex::new(0) });
        attach_client(&channel);
        attach_client(&channel);

        channel.pipes_add_type(7);
        assert_eq!(channel.sum_pipes_size(), 2);
        channel.push();
        assert_eq!(channel.sum_pipes_size(), 0);
    }

    #[test]
    fn pipes_new_add_tail_returns_count_of_produced_items() {
        let channel = channel_with(CountingCallbacks { sent: Mutex::new(0) });
        attach_client(&channel);
        attach_client(&channel);

        let data = 42u32;
        let creator: &PipeItemCreator<'_, ChannelClient, u32> =
            &|_cc, data, index| if index == 0 { Some(Box::new(crate::pipe_item::EmptyItem::new(*data))) } else { None };
        let count = channel.pipes_new_add_tail(&data, creator);
        assert_eq!(count, 1);
        assert_eq!(channel.sum_pipes_size(), 1);
    }

    #[test]
    fn remove_client_asserts_membership_but_is_safe_for_unknown_client() {
        let channel = channel_with(CountingCallbacks { sent: Mutex::new(0) });
        let other_channel = channel_with(CountingCallbacks { sent: Mutex::new(0) });
        let foreign = attach_client(&other_channel);

        // Removing a channel-client that was never added to `channel`
        // should not panic in a release build; in debug it trips the
        // documented assertion, which we don't exercise here since the
        // point is to show the list is left untouched either way.
        channel.state.lock().unwrap().clients.retain(|_| true);
        let before = channel.get_n_clients();
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| channel.remove_client(&foreign)));
        assert_eq!(channel.get_n_clients(), before);
    }
}
