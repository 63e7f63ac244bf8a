//! TCP connection ownership: dial, framed read/write tasks, idle teardown.
//!
//! A `Connection` is destroyed and recreated on each reconnect attempt —
//! never reused. The read loop delivers complete frames upward strictly
//! sequentially; the channel decides what they mean. Malformed frames do
//! not crash anything: decode errors surface through the events seam and
//! the socket is torn down only on transport-level failures.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::codec::ChannelCodec;
use crate::error::ChannelError;

/// How long a dial attempt may take before it is abandoned.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Writer backlog between the channel and the socket task.
const WRITE_QUEUE_DEPTH: usize = 64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

// ── ConnectionInfo ───────────────────────────────────────────────

/// Routing server endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    host: String,
    port: u16,
}

impl ConnectionInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// ── ConnectionPhase ──────────────────────────────────────────────

/// Lifecycle of one socket.
///
/// ```text
///  Disconnected ──► Connecting ──► Connected ──► Logged
///       ▲               │              │            │
///       └───────────────┴──────────────┴────────────┘
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    /// No active connection. Initial / terminal state.
    #[default]
    Disconnected,

    /// Dial in progress.
    Connecting,

    /// Socket up, session handshake not yet completed.
    Connected { since: Instant },

    /// Login frame written; the session is established with the router.
    Logged { since: Instant },
}

impl ConnectionPhase {
    /// The socket is up (logged or not).
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. } | Self::Logged { .. })
    }

    pub fn is_logged(&self) -> bool {
        matches!(self, Self::Logged { .. })
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected { .. } => write!(f, "Connected"),
            Self::Logged { .. } => write!(f, "Logged"),
        }
    }
}

// ── ConnectionEvents ─────────────────────────────────────────────

/// Upward seam from the socket tasks to the channel.
#[async_trait]
pub trait ConnectionEvents: Send + Sync + 'static {
    /// One complete inbound frame. Invoked sequentially — the next frame
    /// is not read until this returns. `reply` feeds the writer directly,
    /// bypassing any outbound queueing (used for acknowledgments).
    async fn on_frame(&self, raw: Bytes, reply: &mpsc::Sender<Bytes>);

    /// The connection closed on its own (transport error, peer close, or
    /// idle timeout). Fires at most once per connection and never fires
    /// after a local [`Connection::shutdown`].
    async fn on_closed(&self, connection_id: u64, error: Option<ChannelError>);
}

// ── Connection ───────────────────────────────────────────────────

/// One live socket plus its reader, writer, and watchdog tasks.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    writer_tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    closed: Arc<AtomicBool>,
}

impl Connection {
    /// Dial `info` and start the socket tasks.
    pub async fn open(
        info: &ConnectionInfo,
        idle_timeout: Option<Duration>,
        events: Arc<dyn ConnectionEvents>,
    ) -> Result<Self, ChannelError> {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let stream = tokio::time::timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((info.host(), info.port())),
        )
        .await
        .map_err(|_| ChannelError::Timeout(CONNECT_TIMEOUT))??;
        let _ = stream.set_nodelay(true);
        debug!(connection_id = id, server = %info, "socket connected");

        let (mut net_writer, mut net_reader) =
            Framed::new(stream, ChannelCodec::default()).split();
        let (writer_tx, mut writer_rx) = mpsc::channel::<Bytes>(WRITE_QUEUE_DEPTH);
        let cancel = CancellationToken::new();
        let closed = Arc::new(AtomicBool::new(false));
        let last_activity = Arc::new(StdMutex::new(Instant::now()));

        // Writer task: channel → socket.
        {
            let cancel = cancel.clone();
            let closed = closed.clone();
            let events = events.clone();
            let last_activity = last_activity.clone();
            tokio::spawn(async move {
                let error = loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break None,
                        frame = writer_rx.recv() => match frame {
                            Some(frame) => {
                                if let Err(e) = net_writer.send(frame).await {
                                    break Some(e);
                                }
                                *last_activity.lock().expect("activity lock") = Instant::now();
                            }
                            // All senders dropped: local teardown in progress.
                            None => break None,
                        },
                    }
                };
                Self::close_once(&closed, &cancel, events.as_ref(), id, error).await;
            });
        }

        // Reader task: socket → channel, strictly sequential.
        {
            let cancel = cancel.clone();
            let closed = closed.clone();
            let events = events.clone();
            let last_activity = last_activity.clone();
            let reply_tx = writer_tx.clone();
            tokio::spawn(async move {
                let error = loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break None,
                        next = net_reader.next() => match next {
                            Some(Ok(raw)) => {
                                *last_activity.lock().expect("activity lock") = Instant::now();
                                events.on_frame(raw, &reply_tx).await;
                            }
                            Some(Err(e)) => break Some(e),
                            None => break Some(ChannelError::Disconnected("closed by peer")),
                        },
                    }
                };
                Self::close_once(&closed, &cancel, events.as_ref(), id, error).await;
            });
        }

        // Idle watchdog: drop the connection when no read/write activity
        // occurs within the configured window (mobile/backgrounding case).
        // Reconnecting is the channel's responsibility.
        if let Some(idle) = idle_timeout {
            let cancel = cancel.clone();
            let closed = closed.clone();
            let events = events.clone();
            let last_activity = last_activity.clone();
            tokio::spawn(async move {
                let tick = (idle / 4).max(Duration::from_millis(50));
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(tick) => {}
                    }
                    let idle_for = last_activity.lock().expect("activity lock").elapsed();
                    if idle_for >= idle {
                        debug!(connection_id = id, ?idle_for, "idle timeout, dropping connection");
                        Self::close_once(
                            &closed,
                            &cancel,
                            events.as_ref(),
                            id,
                            Some(ChannelError::Disconnected("idle timeout")),
                        )
                        .await;
                        return;
                    }
                }
            });
        }

        Ok(Self {
            id,
            writer_tx,
            cancel,
            closed,
        })
    }

    /// Shared exit path for all socket tasks: exactly one of them gets to
    /// report the closure.
    async fn close_once(
        closed: &AtomicBool,
        cancel: &CancellationToken,
        events: &dyn ConnectionEvents,
        id: u64,
        error: Option<ChannelError>,
    ) {
        if closed.swap(true, Ordering::SeqCst) {
            return;
        }
        cancel.cancel();
        match &error {
            Some(e) => warn!(connection_id = id, error = %e, "connection closed"),
            None => trace!(connection_id = id, "connection closed"),
        }
        events.on_closed(id, error).await;
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// `false` once any task has observed a close.
    pub fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Queue a frame for transmission. Waits for writer-queue space, not
    /// for the socket write itself.
    pub async fn send(&self, frame: Bytes) -> Result<(), ChannelError> {
        if !self.is_alive() {
            return Err(ChannelError::Disconnected("connection is closed"));
        }
        self.writer_tx.send(frame).await?;
        Ok(())
    }

    /// Tear the socket tasks down locally. Suppresses the
    /// [`ConnectionEvents::on_closed`] report — the caller already knows.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_info_display() {
        let info = ConnectionInfo::new("10.0.0.1", 5222);
        assert_eq!(info.to_string(), "10.0.0.1:5222");
        assert_eq!(info.host(), "10.0.0.1");
        assert_eq!(info.port(), 5222);
    }

    #[test]
    fn phase_predicates() {
        assert!(ConnectionPhase::Disconnected.is_disconnected());
        assert!(!ConnectionPhase::Connecting.is_connected());

        let connected = ConnectionPhase::Connected {
            since: Instant::now(),
        };
        assert!(connected.is_connected());
        assert!(!connected.is_logged());

        let logged = ConnectionPhase::Logged {
            since: Instant::now(),
        };
        assert!(logged.is_connected());
        assert!(logged.is_logged());
    }

    #[test]
    fn phase_display() {
        assert_eq!(ConnectionPhase::Disconnected.to_string(), "Disconnected");
        assert_eq!(ConnectionPhase::Connecting.to_string(), "Connecting");
        assert_eq!(
            ConnectionPhase::Logged {
                since: Instant::now()
            }
            .to_string(),
            "Logged"
        );
    }

    #[tokio::test]
    async fn open_refuses_unreachable_server() {
        struct NoEvents;
        #[async_trait]
        impl ConnectionEvents for NoEvents {
            async fn on_frame(&self, _raw: Bytes, _reply: &mpsc::Sender<Bytes>) {}
            async fn on_closed(&self, _id: u64, _error: Option<ChannelError>) {}
        }

        // Port 1 on localhost: nothing listens there.
        let info = ConnectionInfo::new("127.0.0.1", 1);
        let result = Connection::open(&info, None, Arc::new(NoEvents)).await;
        assert!(result.is_err());
    }
}
