//! Process-wide channel registry and connectivity state.
//!
//! The host application owns one registry and passes it to every channel
//! it creates. Connectivity changes (airplane mode, network handover)
//! arrive here once and fan out to every live channel, instead of each
//! channel polling the OS on its own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::channel::ChannelInner;

/// Shared registry of all channels in the process.
///
/// Holds channels weakly so that dropping every `Channel` handle destroys
/// the channel; the registry prunes dead entries as it iterates.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    channels: Mutex<Vec<Weak<ChannelInner>>>,
    no_internet: AtomicBool,
}

impl ChannelRegistry {
    /// New registry with internet access assumed available.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, channel: &Arc<ChannelInner>) {
        let mut channels = self.inner.channels.lock().expect("registry lock");
        channels.push(Arc::downgrade(channel));
    }

    /// Channels still alive, with dead entries pruned.
    fn alive(&self) -> Vec<Arc<ChannelInner>> {
        let mut channels = self.inner.channels.lock().expect("registry lock");
        channels.retain(|weak| weak.strong_count() > 0);
        channels.iter().filter_map(Weak::upgrade).collect()
    }

    /// Number of live channels.
    pub fn channel_count(&self) -> usize {
        self.alive().len()
    }

    /// Whether the host currently reports internet access. Connect
    /// attempts are refused while this is `false`.
    pub fn internet_access(&self) -> bool {
        !self.inner.no_internet.load(Ordering::SeqCst)
    }

    /// Report a connectivity change from the host.
    ///
    /// Edge-triggered: losing access disconnects every channel at once;
    /// regaining it reconnects every channel that has pending traffic or
    /// was connected before. Repeating the current value does nothing.
    pub async fn set_internet_access(&self, available: bool) {
        let was_available = !self.inner.no_internet.swap(!available, Ordering::SeqCst);
        if was_available == available {
            return;
        }
        debug!(available, "internet access changed");
        if available {
            self.re_establish_connections().await;
        } else {
            for channel in self.alive() {
                channel.disconnect(false).await;
            }
        }
    }

    /// Kick every live channel into a reconnect-and-flush attempt.
    ///
    /// Failures are per-channel and already recorded in that channel's
    /// diagnostics; one unreachable server must not stop the others.
    pub async fn re_establish_connections(&self) {
        for channel in self.alive() {
            let _ = channel.connect_and_flush().await;
        }
    }

    /// Disconnect every live channel, as on host shutdown or suspend.
    pub async fn disconnect_all(&self) {
        for channel in self.alive() {
            channel.disconnect(true).await;
        }
    }
}
