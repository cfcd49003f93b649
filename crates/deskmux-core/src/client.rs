//! Per-user aggregate of channel-clients across all channels, and the
//! migration state machine that rides on top of it.
//!
//! A [`Client`] is not bound to any single thread the way a [`Channel`] is:
//! its `channels` list, migration flags, and migration counter are all
//! guarded by one mutex. Channel-clients themselves may be driven from their
//! owning channel's thread; only the bookkeeping here is cross-thread.

use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use crate::channel_client::ChannelClient;
use crate::error::MigrationError;

/// Seam for the collaborator that the source calls the main dispatcher: the
/// thread that owns supervision of migration completion. Out of scope to
/// implement fully (spec.md §1); this is just the notification point.
pub trait MigrationSupervisor: Send + Sync {
    /// Called exactly once, when a client's outstanding seamless-migration
    /// channel count reaches zero.
    fn seamless_migrate_dst_complete(&self, client: &Arc<Client>);

    /// Called exactly once, when a semi-seamless migration finishes.
    fn on_client_semi_seamless_migrate_complete(&self, client: &Arc<Client>);
}

/// The migration state a [`Client`] is in, derived from its two flags plus
/// the outstanding-channel counter. Unrepresentable illegal states (e.g.
/// `seamless_migrate` without `during_target_migrate`) are ruled out by
/// keeping the flags private and only ever mutating them through the state
/// transition methods below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    /// Not migrating.
    None,
    /// Target-side, lightweight migration: completes on one signal.
    SemiSeamlessTarget,
    /// Target-side, full state transfer: completes when every channel's
    /// data has arrived.
    SeamlessTarget { outstanding: u32 },
}

struct ClientState {
    channels: Vec<Arc<ChannelClient>>,
    during_target_migrate: bool,
    seamless_migrate: bool,
    num_migrated_channels: u32,
    main_channel_client: Option<Arc<ChannelClient>>,
}

impl ClientState {
    fn migration_state(&self) -> MigrationState {
        match (self.during_target_migrate, self.seamless_migrate) {
            (false, _) => MigrationState::None,
            (true, false) => MigrationState::SemiSeamlessTarget,
            (true, true) => MigrationState::SeamlessTarget {
                outstanding: self.num_migrated_channels,
            },
        }
    }
}

/// Per-user aggregate spanning every channel the user is connected to.
/// Constructed with `refs = 1`; released when the last `Arc` drops.
pub struct Client {
    thread_id: ThreadId,
    state: Mutex<ClientState>,
    supervisor: Option<Box<dyn MigrationSupervisor>>,
}

impl Client {
    pub fn new(during_target_migrate: bool, supervisor: Option<Box<dyn MigrationSupervisor>>) -> Arc<Self> {
        Arc::new(Self {
            thread_id: thread::current().id(),
            state: Mutex::new(ClientState {
                channels: Vec::new(),
                during_target_migrate,
                seamless_migrate: false,
                num_migrated_channels: 0,
                main_channel_client: None,
            }),
            supervisor,
        })
    }

    pub fn migration_state(&self) -> MigrationState {
        self.state.lock().unwrap().migration_state()
    }

    pub fn during_target_migrate(&self) -> bool {
        self.state.lock().unwrap().during_target_migrate
    }

    pub fn main_channel_client(&self) -> Option<Arc<ChannelClient>> {
        self.state.lock().unwrap().main_channel_client.clone()
    }

    pub fn set_main_channel_client(&self, mcc: Arc<ChannelClient>) {
        self.state.lock().unwrap().main_channel_client = Some(mcc);
    }

    pub fn get_channel(&self, channel_type: u32, id: u32) -> Option<Arc<ChannelClient>> {
        self.state
            .lock()
            .unwrap()
            .channels
            .iter()
            .find(|cc| cc.channel().channel_type() == channel_type && cc.channel().id() == id)
            .cloned()
    }

    /// Prepend `cc` to the channels list. If the client is mid target-migrate
    /// in seamless mode, offer this channel-client seamless participation
    /// right away (channel-clients connecting after `set_migration_seamless`
    /// ran would otherwise never be asked).
    pub fn add_channel(self: &Arc<Self>, cc: Arc<ChannelClient>) {
        let mut state = self.state.lock().unwrap();
        state.channels.push(cc.clone());
        if state.during_target_migrate && state.seamless_migrate && cc.set_migration_seamless() {
            state.num_migrated_channels += 1;
        }
    }

    pub fn remove_channel(&self, cc: &Arc<ChannelClient>) {
        let mut state = self.state.lock().unwrap();
        state.channels.retain(|existing| !Arc::ptr_eq(existing, cc));
    }

    /// Transition `SemiSeamlessTarget` -> `SeamlessTarget`. Every
    /// already-connected channel-client is offered seamless participation;
    /// the counter starts at however many accept.
    pub fn set_migration_seamless(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        assert!(state.during_target_migrate, "set_migration_seamless requires during_target_migrate");
        state.seamless_migrate = true;
        let channels: Vec<_> = state.channels.clone();
        for cc in &channels {
            if cc.set_migration_seamless() {
                state.num_migrated_channels += 1;
            }
        }
    }

    /// A channel-client has finished receiving its seamless-migration data
    /// blob. Decrements the outstanding counter; when it reaches zero the
    /// migration flags clear and the supervisor is notified exactly once.
    /// Returns whether this call triggered that completion.
    pub fn seamless_migration_done_for_channel(self: &Arc<Self>) -> bool {
        let done = {
            let mut state = self.state.lock().unwrap();
            debug_assert!(state.num_migrated_channels > 0, "seamless_migration_done_for_channel underflow");
            state.num_migrated_channels = state.num_migrated_channels.saturating_sub(1);
            if state.num_migrated_channels == 0 {
                state.during_target_migrate = false;
                state.seamless_migrate = false;
                true
            } else {
                false
            }
        };
        if done {
            if let Some(supervisor) = &self.supervisor {
                supervisor.seamless_migrate_dst_complete(self);
            }
        }
        done
    }

    /// Completes a semi-seamless migration: requires
    /// `during_target_migrate && !seamless_migrate`, else surfaces
    /// [`MigrationError::UnexpectedState`] and leaves state untouched (the
    /// source logs `spice_error("unexpected")` and bails, it does not abort).
    pub fn semi_seamless_migrate_complete(self: &Arc<Self>) -> Result<(), MigrationError> {
        let channels = {
            let mut state = self.state.lock().unwrap();
            if !state.during_target_migrate || state.seamless_migrate {
                return Err(MigrationError::UnexpectedState);
            }
            state.during_target_migrate = false;
            state.channels.clone()
        };
        for cc in &channels {
            cc.semi_seamless_migration_complete();
        }
        if let Some(supervisor) = &self.supervisor {
            supervisor.on_client_semi_seamless_migrate_complete(self);
        }
        Ok(())
    }

    /// Invokes each connected channel-client's `client_cbs.migrate`. Must run
    /// on the client's thread; a cross-thread call is logged, not refused.
    pub fn migrate(self: &Arc<Self>) {
        if thread::current().id() != self.thread_id {
            tracing::warn!("Client::migrate invoked off the client's owning thread");
        }
        let channels = self.state.lock().unwrap().channels.clone();
        for cc in &channels {
            if cc.is_connected() {
                cc.channel().client_callbacks().migrate(cc);
            }
        }
    }

    /// Tears down every channel-client: marks each destroying, runs its
    /// channel's synchronous `disconnect` callback, asserts nothing is left
    /// in flight, then releases it. The `Arc<Client>` itself is consumed by
    /// the caller dropping their last strong reference afterward.
    pub fn destroy(self: &Arc<Self>) {
        let channels = {
            let mut state = self.state.lock().unwrap();
            std::mem::take(&mut state.channels)
        };
        if thread::current().id() != self.thread_id {
            tracing::warn!("Client::destroy invoked off the client's owning thread");
        }
        for cc in &channels {
            cc.mark_destroying();
            let channel = cc.channel().clone();
            channel.client_callbacks().disconnect(cc);
            cc.assert_idle();
        }
    }
}
