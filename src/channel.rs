//! The channel: connection lifecycle, frame dispatch, and diagnostics.
//!
//! One `Channel` per logical network domain per process. The layer above
//! hands it already-framed byte payloads to send and receives plaintext
//! posts and delivery confirmations back through [`ChannelEvents`]. The
//! router never learns message content or sender identity beyond the
//! opaque numeric domain — this layer only moves bytes reliably.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::anti_duplicate::AntiDuplicate;
use crate::command::Command;
use crate::connection::{Connection, ConnectionEvents, ConnectionInfo, ConnectionPhase};
use crate::error::ChannelError;
use crate::frame::{self, Frame};
use crate::registry::ChannelRegistry;
use crate::spooler::Spooler;

// ── ChannelEvents ────────────────────────────────────────────────

/// Application-side callback surface.
///
/// Callbacks fire from the channel's background tasks, not necessarily on
/// the thread that called [`Channel::send`]; each event fires exactly
/// once.
pub trait ChannelEvents: Send + Sync + 'static {
    /// A post arrived for `chat_id`. Never invoked twice for identical
    /// content within the duplicate-retention window.
    fn on_message_arrives(&self, chat_id: u64, post: Bytes);

    /// The router confirmed delivery of the payload sent as `data_id`.
    fn on_data_delivery_confirm(&self, data_id: u32);

    /// Gate for connection attempts: the layer above may not be ready to
    /// process traffic yet (keys not derived, storage not open, ...).
    fn context_is_ready(&self) -> bool {
        true
    }
}

// ── ChannelStatus ────────────────────────────────────────────────

/// Coarse failure class recorded for diagnostics. `Working` is the
/// nominal, non-error marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelStatus {
    #[default]
    Working,
    MalformedFrame,
    UnsupportedCommand,
    Transport,
    Disconnected,
}

impl From<&ChannelError> for ChannelStatus {
    fn from(error: &ChannelError) -> Self {
        match error {
            ChannelError::MalformedFrame(_) | ChannelError::FrameTooLarge { .. } => {
                Self::MalformedFrame
            }
            ChannelError::UnsupportedCommand(_) => Self::UnsupportedCommand,
            ChannelError::Transport(_) | ChannelError::Timeout(_) => Self::Transport,
            ChannelError::ChannelClosed | ChannelError::Disconnected(_) => Self::Disconnected,
        }
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ── Options ──────────────────────────────────────────────────────

/// Construction parameters for a channel.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Routing server endpoint.
    pub server: ConnectionInfo,
    /// Traffic partition on the server (e.g. MainNet vs TestNet).
    pub domain: u32,
    /// Cryptographic identity of the local client; opaque to this layer.
    pub my_id: u64,
    /// Drop the connection after this much inactivity; `None` keeps it
    /// open indefinitely. Mobile hosts use a finite timeout since the OS
    /// kills background connections anyway.
    pub idle_timeout: Option<Duration>,
}

// ── Diagnostics ──────────────────────────────────────────────────

#[derive(Default)]
struct Diagnostics {
    post_counter: AtomicU64,
    duplicate_posts: AtomicU64,
    last_post_parts: AtomicUsize,
    status: StdMutex<(ChannelStatus, String)>,
    error_log: StdMutex<String>,
}

/// Read-only diagnostic snapshot, consumed by monitoring/UI — never by
/// protocol logic.
#[derive(Debug, Clone)]
pub struct DiagnosticsSnapshot {
    /// Outbound frames awaiting delivery confirmation.
    pub queue_count: usize,
    /// Posts delivered to the application.
    pub post_counter: u64,
    /// Posts suppressed as duplicates.
    pub duplicate_posts: u64,
    /// Split count of the most recent `Messages` frame.
    pub last_post_parts: usize,
    /// Most recent failure class (`Working` when nominal).
    pub status: ChannelStatus,
    /// Human-readable description of the most recent error.
    pub status_description: String,
    /// Append-only error history, for developer visibility.
    pub error_log: String,
}

// ── Channel ──────────────────────────────────────────────────────

/// Cloneable handle to one channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

pub(crate) struct ChannelInner {
    options: ChannelOptions,
    events: Arc<dyn ChannelEvents>,
    registry: ChannelRegistry,
    spooler: Spooler,
    anti_duplicate: StdMutex<AntiDuplicate>,
    /// Single serialization point for connect/disconnect transitions:
    /// a connectivity fan-out and an application-triggered reconnect can
    /// never race two sockets open for the same channel.
    link: AsyncMutex<Option<Connection>>,
    phase: StdMutex<ConnectionPhase>,
    diagnostics: Diagnostics,
}

impl Channel {
    /// Create a channel and register it with `registry` so that
    /// connectivity-change fan-outs reach it.
    pub fn new(
        registry: &ChannelRegistry,
        options: ChannelOptions,
        events: Arc<dyn ChannelEvents>,
    ) -> Self {
        let inner = Arc::new(ChannelInner {
            options,
            events,
            registry: registry.clone(),
            spooler: Spooler::new(),
            anti_duplicate: StdMutex::new(AntiDuplicate::new()),
            link: AsyncMutex::new(None),
            phase: StdMutex::new(ConnectionPhase::Disconnected),
            diagnostics: Diagnostics::default(),
        });
        registry.register(&inner);
        Self { inner }
    }

    /// Queue `payload` for delivery and return its data id.
    ///
    /// Fire-and-forget: never blocks on network I/O. Triggers a connection
    /// attempt when disconnected; the matching
    /// [`ChannelEvents::on_data_delivery_confirm`] arrives asynchronously,
    /// possibly after any number of reconnects.
    pub fn send(&self, payload: impl Into<Bytes>) -> u32 {
        let data_id = self.inner.spooler.enqueue(payload.into());
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _ = inner.connect_and_flush().await;
        });
        data_id
    }

    /// Connection state at the moment of the call.
    pub fn is_connected(&self) -> bool {
        self.inner.phase.lock().expect("phase lock").is_connected()
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.inner.phase.lock().expect("phase lock").clone()
    }

    /// Attempt to (re)connect and flush pending frames. Concurrent calls
    /// wait for the in-flight attempt instead of racing a second socket.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        self.inner.connect_and_flush().await
    }

    /// Tear down the connection. `explicit` marks an application-requested
    /// teardown; `false` is used for connectivity loss and idle timeouts
    /// and is not treated as an error worth surfacing loudly.
    pub async fn disconnect(&self, explicit: bool) {
        self.inner.disconnect(explicit).await;
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.inner.options
    }

    /// Outbound frames awaiting delivery confirmation.
    pub fn queue_count(&self) -> usize {
        self.inner.spooler.queue_count()
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.inner.snapshot()
    }
}

impl ChannelInner {
    pub(crate) async fn connect_and_flush(self: &Arc<Self>) -> Result<(), ChannelError> {
        let mut link = self.link.lock().await;
        if !self.registry.internet_access() {
            trace!("no internet access, connect skipped");
            return Err(ChannelError::Disconnected("no internet access"));
        }
        if !self.events.context_is_ready() {
            trace!("context not ready, connect skipped");
            return Err(ChannelError::Disconnected("context not ready"));
        }

        if link.as_ref().map_or(true, |c| !c.is_alive()) {
            *link = None;
            self.set_phase(ConnectionPhase::Connecting);
            let events: Arc<dyn ConnectionEvents> = Arc::new(LinkEvents {
                channel: Arc::downgrade(self),
            });
            let conn =
                match Connection::open(&self.options.server, self.options.idle_timeout, events)
                    .await
                {
                    Ok(conn) => conn,
                    Err(e) => {
                        self.record_error(&e);
                        self.set_phase(ConnectionPhase::Disconnected);
                        return Err(e);
                    }
                };
            self.set_phase(ConnectionPhase::Connected {
                since: Instant::now(),
            });

            // Session handshake: the router learns who we are and which
            // traffic domain this channel belongs to.
            let login = Frame::login(self.options.my_id, self.options.domain).encode();
            if let Err(e) = conn.send(login).await {
                self.record_error(&e);
                conn.shutdown();
                self.set_phase(ConnectionPhase::Disconnected);
                return Err(e);
            }
            self.set_phase(ConnectionPhase::Logged {
                since: Instant::now(),
            });
            self.set_status_working();

            // Everything still unconfirmed goes out again, oldest first.
            self.spooler.reset_in_flight();
            *link = Some(conn);
            debug!(server = %self.options.server, domain = self.options.domain, "channel logged in");
        }

        // Flush under the same lock so concurrent send kicks cannot
        // interleave out of enqueue order.
        if let Some(conn) = link.as_ref() {
            for (data_id, payload) in self.spooler.take_unsent() {
                if let Err(e) = conn.send(payload).await {
                    self.record_error(&e);
                    break;
                }
                trace!(data_id, "frame handed to socket writer");
            }
        }
        Ok(())
    }

    pub(crate) async fn disconnect(&self, explicit: bool) {
        let mut link = self.link.lock().await;
        if let Some(conn) = link.take() {
            conn.shutdown();
        }
        self.set_phase(ConnectionPhase::Disconnected);
        self.spooler.reset_in_flight();
        if explicit {
            debug!("channel disconnected (explicit)");
        } else {
            // Loss of internet access or idle teardown: routine, quiet.
            trace!("channel disconnected");
        }
    }

    /// Single entry point for every complete inbound frame. Policy order:
    /// reject empty, reject unknown command, acknowledge, then dispatch.
    /// The ack precedes semantic decode, so a recognized command whose
    /// body fails decode has still been acknowledged.
    async fn on_data_receives(
        &self,
        raw: Bytes,
        reply: &mpsc::Sender<Bytes>,
    ) -> Result<(), ChannelError> {
        let frame = Frame::decode(&raw)?;

        if frame.command().requires_ack() {
            let ack = Frame::data_received_confirmation(frame::data_id(&raw)).encode();
            // Write failures surface through the writer task's close path.
            let _ = reply.send(ack).await;
        }

        match frame.command() {
            Command::Messages => {
                let (chat_id, posts) = frame.split_posts()?;
                self.diagnostics
                    .last_post_parts
                    .store(posts.len(), Ordering::Relaxed);
                for post in posts {
                    let duplicate = self
                        .anti_duplicate
                        .lock()
                        .expect("anti-duplicate lock")
                        .already_received(&post);
                    if duplicate {
                        self.diagnostics
                            .duplicate_posts
                            .fetch_add(1, Ordering::Relaxed);
                        trace!(chat_id, "duplicate post suppressed");
                    } else {
                        self.diagnostics.post_counter.fetch_add(1, Ordering::Relaxed);
                        self.events.on_message_arrives(chat_id, post);
                    }
                }
            }
            Command::DataReceivedConfirmation => {
                let data_id = frame.confirmation_data_id()?;
                // Idempotent: a duplicate confirmation after a reconnect
                // race matches nothing and changes nothing.
                if self.spooler.confirm(data_id).is_some() {
                    self.events.on_data_delivery_confirm(data_id);
                }
            }
            Command::Ping => {
                trace!("ping received");
            }
            Command::ConnectionEstablished => {
                // Router re-affirms the session.
                let mut phase = self.phase.lock().expect("phase lock");
                if phase.is_connected() && !phase.is_logged() {
                    *phase = ConnectionPhase::Logged {
                        since: Instant::now(),
                    };
                }
            }
        }
        Ok(())
    }

    async fn handle_closed(&self, connection_id: u64, error: Option<ChannelError>) {
        let mut link = self.link.lock().await;
        // A close report for a connection that was already replaced is stale.
        if link.as_ref().map(Connection::id) != Some(connection_id) {
            return;
        }
        *link = None;
        self.set_phase(ConnectionPhase::Disconnected);
        self.spooler.reset_in_flight();
        if let Some(e) = error {
            self.record_error(&e);
        }
    }

    fn set_phase(&self, phase: ConnectionPhase) {
        *self.phase.lock().expect("phase lock") = phase;
    }

    fn record_error(&self, error: &ChannelError) {
        let status = ChannelStatus::from(error);
        let description = error.to_string();
        warn!(%status, %description, "channel error");
        *self.diagnostics.status.lock().expect("status lock") = (status, description.clone());

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut log = self.diagnostics.error_log.lock().expect("error log lock");
        log.push_str(&format!("[{now}] {status}: {description}\n"));
    }

    fn set_status_working(&self) {
        *self.diagnostics.status.lock().expect("status lock") =
            (ChannelStatus::Working, String::new());
    }

    fn snapshot(&self) -> DiagnosticsSnapshot {
        let (status, status_description) =
            self.diagnostics.status.lock().expect("status lock").clone();
        DiagnosticsSnapshot {
            queue_count: self.spooler.queue_count(),
            post_counter: self.diagnostics.post_counter.load(Ordering::Relaxed),
            duplicate_posts: self.diagnostics.duplicate_posts.load(Ordering::Relaxed),
            last_post_parts: self.diagnostics.last_post_parts.load(Ordering::Relaxed),
            status,
            status_description,
            error_log: self
                .diagnostics
                .error_log
                .lock()
                .expect("error log lock")
                .clone(),
        }
    }
}

// ── LinkEvents ───────────────────────────────────────────────────

/// Per-connection adapter wiring socket events back into the channel.
struct LinkEvents {
    channel: Weak<ChannelInner>,
}

#[async_trait]
impl ConnectionEvents for LinkEvents {
    async fn on_frame(&self, raw: Bytes, reply: &mpsc::Sender<Bytes>) {
        let Some(channel) = self.channel.upgrade() else {
            return;
        };
        if let Err(e) = channel.on_data_receives(raw, reply).await {
            // A bad frame aborts only itself; the connection stays up.
            channel.record_error(&e);
        }
    }

    async fn on_closed(&self, connection_id: u64, error: Option<ChannelError>) {
        if let Some(channel) = self.channel.upgrade() {
            channel.handle_closed(connection_id, error).await;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        messages: Mutex<Vec<(u64, Bytes)>>,
        confirms: Mutex<Vec<u32>>,
    }

    impl ChannelEvents for Recording {
        fn on_message_arrives(&self, chat_id: u64, post: Bytes) {
            self.messages.lock().unwrap().push((chat_id, post));
        }

        fn on_data_delivery_confirm(&self, data_id: u32) {
            self.confirms.lock().unwrap().push(data_id);
        }
    }

    fn test_channel() -> (Channel, Arc<Recording>) {
        let registry = ChannelRegistry::new();
        let events = Arc::new(Recording::default());
        let options = ChannelOptions {
            server: ConnectionInfo::new("127.0.0.1", 1),
            domain: 1,
            my_id: 42,
            idle_timeout: None,
        };
        let channel = Channel::new(&registry, options, events.clone());
        (channel, events)
    }

    #[tokio::test]
    async fn empty_frame_is_wrong_data_length() {
        let (channel, _) = test_channel();
        let (tx, _rx) = mpsc::channel(8);
        let err = channel
            .inner
            .on_data_receives(Bytes::new(), &tx)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::MalformedFrame(_)));
    }

    #[tokio::test]
    async fn unknown_command_is_not_acked() {
        let (channel, _) = test_channel();
        let (tx, mut rx) = mpsc::channel(8);
        let err = channel
            .inner
            .on_data_receives(Bytes::from_static(&[0xEE, 1, 2]), &tx)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::UnsupportedCommand(0xEE)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn ping_is_acked_and_changes_no_counters() {
        let (channel, events) = test_channel();
        let (tx, mut rx) = mpsc::channel(8);
        let raw = Frame::ping().encode();
        channel.inner.on_data_receives(raw.clone(), &tx).await.unwrap();

        let ack = Frame::decode(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(ack.command(), Command::DataReceivedConfirmation);
        assert_eq!(ack.confirmation_data_id().unwrap(), frame::data_id(&raw));

        assert_eq!(channel.diagnostics().post_counter, 0);
        assert!(events.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn messages_dispatch_and_duplicate_suppression() {
        let (channel, events) = test_channel();
        let (tx, mut rx) = mpsc::channel(8);

        let raw = Frame::messages(
            42,
            &[Bytes::from_static(b"hello"), Bytes::from_static(b"world")],
        )
        .encode();
        channel.inner.on_data_receives(raw.clone(), &tx).await.unwrap();

        {
            let messages = events.messages.lock().unwrap();
            assert_eq!(messages.len(), 2);
            assert_eq!(messages[0], (42, Bytes::from_static(b"hello")));
            assert_eq!(messages[1], (42, Bytes::from_static(b"world")));
        }
        let diag = channel.diagnostics();
        assert_eq!(diag.post_counter, 2);
        assert_eq!(diag.last_post_parts, 2);
        assert_eq!(diag.duplicate_posts, 0);
        assert!(rx.try_recv().is_ok()); // ack for the frame

        // Redelivery of the same frame: both posts suppressed.
        channel.inner.on_data_receives(raw, &tx).await.unwrap();
        let diag = channel.diagnostics();
        assert_eq!(diag.post_counter, 2);
        assert_eq!(diag.duplicate_posts, 2);
        assert_eq!(events.messages.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn malformed_messages_frame_is_acked_but_delivers_nothing() {
        let (channel, events) = test_channel();
        let (tx, mut rx) = mpsc::channel(8);

        // Declared post length exceeds remaining bytes.
        let mut payload = bytes::BytesMut::new();
        use bytes::BufMut;
        payload.put_u8(Command::Messages as u8);
        payload.put_u64_le(7);
        payload.put_i32_le(100);
        payload.extend_from_slice(b"short");

        let err = channel
            .inner
            .on_data_receives(payload.freeze(), &tx)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::MalformedFrame(_)));
        // Recognized command: the ack went out before decode failed.
        assert!(rx.try_recv().is_ok());
        assert!(events.messages.lock().unwrap().is_empty());
        assert_eq!(channel.diagnostics().post_counter, 0);
    }

    #[tokio::test]
    async fn confirmation_purges_spooler_and_fires_callback_once() {
        let (channel, events) = test_channel();
        let (tx, _rx) = mpsc::channel(8);

        let data_id = channel.inner.spooler.enqueue(Bytes::from_static(b"x"));
        assert_eq!(channel.queue_count(), 1);

        let raw = Frame::data_received_confirmation(data_id).encode();
        channel.inner.on_data_receives(raw.clone(), &tx).await.unwrap();
        assert_eq!(channel.queue_count(), 0);
        assert_eq!(events.confirms.lock().unwrap().as_slice(), &[data_id]);

        // A retransmitted ack is a no-op: no queue change, no callback.
        channel.inner.on_data_receives(raw, &tx).await.unwrap();
        assert_eq!(channel.queue_count(), 0);
        assert_eq!(events.confirms.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn record_error_updates_status_and_log() {
        let (channel, _) = test_channel();
        channel
            .inner
            .record_error(&ChannelError::UnsupportedCommand(0xAB));

        let diag = channel.diagnostics();
        assert_eq!(diag.status, ChannelStatus::UnsupportedCommand);
        assert!(diag.status_description.contains("0xab"));
        assert!(diag.error_log.contains("UnsupportedCommand"));

        // Log is append-only.
        channel
            .inner
            .record_error(&ChannelError::MalformedFrame("zero-length frame"));
        let diag = channel.diagnostics();
        assert_eq!(diag.status, ChannelStatus::MalformedFrame);
        assert!(diag.error_log.contains("UnsupportedCommand"));
        assert!(diag.error_log.contains("MalformedFrame"));
    }
}
