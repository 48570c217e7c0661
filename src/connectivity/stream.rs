// =============================================================================
// Persistent Stream Supervisor — long-lived WebSocket with auto-reconnect
// =============================================================================
//
// States: CONNECTING -> OPEN -> { CLOSING -> CLOSED, ERROR -> RECONNECT_SCHEDULED
// -> CONNECTING }.
//
// Text frames are parsed as JSON and forwarded to the handler. A frame that
// fails to parse goes to the handler's error channel and the connection
// stays open. A read error or remote close schedules a reconnect after
// `base + secure_jitter(0..jitter)` with the same URL and handler.
//
// `stop()` flips a watch flag observed by every await point of the
// supervisor task, then joins the task. Once it returns no reconnect can
// fire.
// =============================================================================

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::error::StreamError;
use crate::observer::Subscribers;
use crate::secure_random::secure_jitter;

// ---------------------------------------------------------------------------
// Handler and connector seams
// ---------------------------------------------------------------------------

/// Receives decoded messages from a supervised stream.
pub trait StreamHandler: Send + Sync {
    fn on_message(&self, message: Value);

    /// Malformed frames and other non-fatal problems.
    fn on_error(&self, _error: &StreamError) {}
}

pub type MessageStream = Pin<Box<dyn Stream<Item = Result<String, StreamError>> + Send>>;

/// Opens one connection and yields its text frames.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<MessageStream, StreamError>;
}

/// Production connector backed by tokio-tungstenite.
#[derive(Debug, Default, Clone)]
pub struct TungsteniteConnector;

#[async_trait]
impl StreamConnector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<MessageStream, StreamError> {
        let (ws_stream, _response) = connect_async(url).await.map_err(|e| StreamError::Connect {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let frames = ws_stream.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(bytes)) => String::from_utf8(bytes).ok().map(Ok),
                Ok(Message::Close(_)) => Some(Err(StreamError::Closed)),
                Ok(_) => None,
                Err(e) => Some(Err(StreamError::Read(e.to_string()))),
            }
        });
        Ok(Box::pin(frames))
    }
}

// ---------------------------------------------------------------------------
// State and events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Error,
    ReconnectScheduled,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::Connecting => "CONNECTING",
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
            Self::Error => "ERROR",
            Self::ReconnectScheduled => "RECONNECT_SCHEDULED",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    StateChanged { topic: String, state: StreamState },
    /// Repeated connection failures without receiving data.
    Instability { topic: String, consecutive_failures: u32 },
}

/// Reconnect delay schedule.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub jitter: Duration,
    /// Consecutive failures that raise an instability event.
    pub instability_threshold: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5_000),
            jitter: Duration::from_millis(5_000),
            instability_threshold: 3,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay(&self) -> Duration {
        self.base + secure_jitter(Duration::ZERO, self.jitter)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamStats {
    pub topic: String,
    pub state: StreamState,
    pub connects: u64,
    pub reconnects: u64,
    pub messages: u64,
    pub parse_errors: u64,
    pub consecutive_failures: u32,
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

struct Inner {
    topic: String,
    url: String,
    handler: Arc<dyn StreamHandler>,
    connector: Arc<dyn StreamConnector>,
    handshake_timeout: Duration,
    policy: ReconnectPolicy,
    state: RwLock<StreamState>,
    reconnect_now: Notify,
    events: Subscribers<StreamEvent>,
    connects: AtomicU64,
    reconnects: AtomicU64,
    messages: AtomicU64,
    parse_errors: AtomicU64,
    consecutive_failures: AtomicU32,
}

enum SessionEnd {
    Stopped,
    Forced,
    Failed(StreamError),
}

pub struct PersistentStreamSupervisor {
    inner: Arc<Inner>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PersistentStreamSupervisor {
    /// Create a supervisor for `url`. Nothing connects until [`start`](Self::start).
    pub fn new(
        topic: impl Into<String>,
        url: impl Into<String>,
        handler: Arc<dyn StreamHandler>,
        connector: Arc<dyn StreamConnector>,
        handshake_timeout: Duration,
        policy: ReconnectPolicy,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                topic: topic.into(),
                url: url.into(),
                handler,
                connector,
                handshake_timeout,
                policy,
                state: RwLock::new(StreamState::Idle),
                reconnect_now: Notify::new(),
                events: Subscribers::new("stream"),
                connects: AtomicU64::new(0),
                reconnects: AtomicU64::new(0),
                messages: AtomicU64::new(0),
                parse_errors: AtomicU64::new(0),
                consecutive_failures: AtomicU32::new(0),
            }),
            stop_tx,
            task: Mutex::new(None),
        }
    }

    /// Spawn the supervisor task. Calling it again while running is a no-op.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() || *self.stop_tx.borrow() {
            return;
        }
        let inner = self.inner.clone();
        let stop_rx = self.stop_tx.subscribe();
        *task = Some(tokio::spawn(run(inner, stop_rx)));
    }

    /// Close the live connection and cancel any pending reconnect. Returns
    /// once the supervisor task has finished.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(topic = %self.inner.topic, error = %e, "stream supervisor task failed");
            }
        }
        self.inner.set_state(StreamState::Closed);
        info!(topic = %self.inner.topic, "stream stopped");
    }

    /// Drop the current connection and reconnect without delay. A request
    /// made while connecting or waiting out a backoff is kept until the
    /// supervisor picks it up.
    pub fn force_reconnect(&self) {
        self.inner.reconnect_now.notify_one();
    }

    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(handler);
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn state(&self) -> StreamState {
        *self.inner.state.read()
    }

    pub fn stats(&self) -> StreamStats {
        let i = &self.inner;
        StreamStats {
            topic: i.topic.clone(),
            state: self.state(),
            connects: i.connects.load(Ordering::Relaxed),
            reconnects: i.reconnects.load(Ordering::Relaxed),
            messages: i.messages.load(Ordering::Relaxed),
            parse_errors: i.parse_errors.load(Ordering::Relaxed),
            consecutive_failures: i.consecutive_failures.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    fn set_state(&self, state: StreamState) {
        let changed = {
            let mut s = self.state.write();
            let changed = *s != state;
            *s = state;
            changed
        };
        if changed {
            debug!(topic = %self.topic, state = %state, "stream state changed");
            self.events.publish(&StreamEvent::StateChanged {
                topic: self.topic.clone(),
                state,
            });
        }
    }

    fn record_failure(&self, err: &StreamError) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        self.set_state(StreamState::Error);
        warn!(topic = %self.topic, error = %err, consecutive_failures = failures, "stream connection lost");
        if failures == self.policy.instability_threshold {
            warn!(topic = %self.topic, consecutive_failures = failures, "stream unstable, reconnects keep failing");
            self.events.publish(&StreamEvent::Instability {
                topic: self.topic.clone(),
                consecutive_failures: failures,
            });
        }
    }

    fn dispatch(&self, text: &str) {
        match serde_json::from_str::<Value>(text) {
            Ok(value) => {
                self.messages.fetch_add(1, Ordering::Relaxed);
                self.consecutive_failures.store(0, Ordering::Relaxed);
                if catch_unwind(AssertUnwindSafe(|| self.handler.on_message(value))).is_err() {
                    error!(topic = %self.topic, "stream handler panicked");
                }
            }
            Err(e) => {
                self.parse_errors.fetch_add(1, Ordering::Relaxed);
                debug!(topic = %self.topic, error = %e, "unparseable stream frame");
                let err = StreamError::Parse(e.to_string());
                if catch_unwind(AssertUnwindSafe(|| self.handler.on_error(&err))).is_err() {
                    error!(topic = %self.topic, "stream error handler panicked");
                }
            }
        }
    }
}

/// Resolves once `stop_rx` reads `true` (or its sender is gone).
pub(crate) async fn stopped(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stopped| *stopped).await;
}

async fn run(inner: Arc<Inner>, mut stop_rx: watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow() {
            break;
        }
        inner.set_state(StreamState::Connecting);
        info!(topic = %inner.topic, url = %inner.url, "connecting stream");

        let connect = tokio::time::timeout(inner.handshake_timeout, inner.connector.connect(&inner.url));
        let connected = tokio::select! {
            biased;
            _ = stopped(&mut stop_rx) => break,
            _ = inner.reconnect_now.notified() => {
                info!(topic = %inner.topic, "forced reconnect while connecting, starting over");
                inner.reconnects.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            r = connect => r,
        };

        let mut forced = false;
        match connected {
            Ok(Ok(mut stream)) => {
                inner.connects.fetch_add(1, Ordering::Relaxed);
                inner.set_state(StreamState::Open);
                info!(topic = %inner.topic, "stream connected");

                let end = loop {
                    tokio::select! {
                        biased;
                        _ = stopped(&mut stop_rx) => break SessionEnd::Stopped,
                        _ = inner.reconnect_now.notified() => break SessionEnd::Forced,
                        frame = stream.next() => match frame {
                            Some(Ok(text)) => inner.dispatch(&text),
                            Some(Err(e)) => break SessionEnd::Failed(e),
                            None => break SessionEnd::Failed(StreamError::Closed),
                        },
                    }
                };

                match end {
                    SessionEnd::Stopped => {
                        inner.set_state(StreamState::Closing);
                        drop(stream);
                        break;
                    }
                    SessionEnd::Forced => {
                        info!(topic = %inner.topic, "forced reconnect requested");
                        forced = true;
                    }
                    SessionEnd::Failed(e) => inner.record_failure(&e),
                }
            }
            Ok(Err(e)) => inner.record_failure(&e),
            Err(_) => inner.record_failure(&StreamError::HandshakeTimeout {
                url: inner.url.clone(),
                timeout_ms: inner.handshake_timeout.as_millis() as u64,
            }),
        }

        if *stop_rx.borrow() {
            break;
        }

        let delay = if forced { Duration::ZERO } else { inner.policy.delay() };
        inner.set_state(StreamState::ReconnectScheduled);
        inner.reconnects.fetch_add(1, Ordering::Relaxed);
        debug!(topic = %inner.topic, delay_ms = delay.as_millis() as u64, "reconnect scheduled");

        tokio::select! {
            biased;
            _ = stopped(&mut stop_rx) => break,
            _ = inner.reconnect_now.notified() => {
                info!(topic = %inner.topic, "forced reconnect cuts backoff short");
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
    inner.set_state(StreamState::Closed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    type Frame = Result<String, StreamError>;

    #[derive(Default)]
    struct FakeConnector {
        fail: bool,
        urls: Mutex<Vec<String>>,
        senders: Mutex<Vec<mpsc::UnboundedSender<Frame>>>,
    }

    impl FakeConnector {
        fn attempts(&self) -> usize {
            self.urls.lock().len()
        }

        fn push(&self, frame: Frame) -> bool {
            match self.senders.lock().last() {
                Some(tx) => tx.send(frame).is_ok(),
                None => false,
            }
        }
    }

    #[async_trait]
    impl StreamConnector for FakeConnector {
        async fn connect(&self, url: &str) -> Result<MessageStream, StreamError> {
            self.urls.lock().push(url.to_string());
            if self.fail {
                return Err(StreamError::Connect {
                    url: url.to_string(),
                    reason: "refused".to_string(),
                });
            }
            let (tx, rx) = mpsc::unbounded_channel();
            self.senders.lock().push(tx);
            let frames = futures_util::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|f| (f, rx)) });
            Ok(Box::pin(frames))
        }
    }

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<Value>>,
        errors: Mutex<Vec<String>>,
    }

    impl StreamHandler for Recorder {
        fn on_message(&self, message: Value) {
            self.messages.lock().push(message);
        }

        fn on_error(&self, error: &StreamError) {
            self.errors.lock().push(error.to_string());
        }
    }

    fn supervisor(connector: Arc<FakeConnector>, handler: Arc<Recorder>) -> PersistentStreamSupervisor {
        PersistentStreamSupervisor::new(
            "btcusdt@aggTrade",
            "wss://example.test/ws/btcusdt@aggTrade",
            handler,
            connector,
            Duration::from_secs(5),
            ReconnectPolicy::default(),
        )
    }

    async fn wait_for(s: &PersistentStreamSupervisor, want: StreamState) {
        for _ in 0..200 {
            if s.state() == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("stream never reached {want}, stuck in {}", s.state());
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_messages_and_survives_parse_errors() {
        let conn = Arc::new(FakeConnector::default());
        let rec = Arc::new(Recorder::default());
        let s = supervisor(conn.clone(), rec.clone());
        s.start();
        wait_for(&s, StreamState::Open).await;

        assert!(conn.push(Ok(r#"{"p":"50000.0"}"#.to_string())));
        assert!(conn.push(Ok("not json".to_string())));
        assert!(conn.push(Ok(r#"{"p":"50001.0"}"#.to_string())));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(rec.messages.lock().len(), 2);
        assert_eq!(rec.errors.lock().len(), 1);
        assert_eq!(s.state(), StreamState::Open);
        assert_eq!(conn.attempts(), 1);
        assert_eq!(s.stats().parse_errors, 1);
        s.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_with_same_url_after_error() {
        let conn = Arc::new(FakeConnector::default());
        let rec = Arc::new(Recorder::default());
        let s = supervisor(conn.clone(), rec.clone());
        s.start();
        wait_for(&s, StreamState::Open).await;

        conn.push(Err(StreamError::Read("connection reset".into())));
        wait_for(&s, StreamState::ReconnectScheduled).await;
        assert_eq!(conn.attempts(), 1);

        // 5 s base + up to 5 s jitter.
        tokio::time::sleep(Duration::from_secs(11)).await;
        wait_for(&s, StreamState::Open).await;
        let urls = conn.urls.lock().clone();
        assert_eq!(urls.len(), 2);
        assert_eq!(urls[0], urls[1]);

        // The original handler still receives messages.
        conn.push(Ok(r#"{"ok":true}"#.to_string()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(rec.messages.lock().len(), 1);
        s.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_then_network_error_does_not_reconnect() {
        let conn = Arc::new(FakeConnector::default());
        let s = supervisor(conn.clone(), Arc::new(Recorder::default()));
        s.start();
        wait_for(&s, StreamState::Open).await;

        s.stop().await;
        assert_eq!(s.state(), StreamState::Closed);

        // The connection is gone; a late error has nowhere to land.
        let delivered = conn.push(Err(StreamError::Read("connection reset".into())));
        assert!(!delivered);
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(conn.attempts(), 1);
        assert_eq!(s.state(), StreamState::Closed);
        assert_eq!(s.stats().reconnects, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_reconnect() {
        let conn = Arc::new(FakeConnector::default());
        let s = supervisor(conn.clone(), Arc::new(Recorder::default()));
        s.start();
        wait_for(&s, StreamState::Open).await;

        conn.push(Err(StreamError::Closed));
        wait_for(&s, StreamState::ReconnectScheduled).await;
        s.stop().await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(conn.attempts(), 1);
        assert_eq!(s.state(), StreamState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_reconnect_is_immediate() {
        let conn = Arc::new(FakeConnector::default());
        let s = supervisor(conn.clone(), Arc::new(Recorder::default()));
        s.start();
        wait_for(&s, StreamState::Open).await;

        s.force_reconnect();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(conn.attempts(), 2);
        assert_eq!(s.state(), StreamState::Open);
        s.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn forced_reconnect_during_backoff_skips_the_wait() {
        let conn = Arc::new(FakeConnector::default());
        let s = supervisor(conn.clone(), Arc::new(Recorder::default()));
        s.start();
        wait_for(&s, StreamState::Open).await;

        conn.push(Err(StreamError::Read("connection reset".into())));
        wait_for(&s, StreamState::ReconnectScheduled).await;
        assert_eq!(conn.attempts(), 1);

        s.force_reconnect();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(conn.attempts(), 2);
        assert_eq!(s.state(), StreamState::Open);
        s.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn forced_reconnect_before_the_loop_waits_is_not_lost() {
        let conn = Arc::new(FakeConnector::default());
        let s = supervisor(conn.clone(), Arc::new(Recorder::default()));
        s.start();
        wait_for(&s, StreamState::Open).await;

        // Error and force land together, before the supervisor reaches its
        // backoff sleep.
        conn.push(Err(StreamError::Closed));
        s.force_reconnect();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(conn.attempts(), 2);
        assert_eq!(s.state(), StreamState::Open);
        s.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_connect_failures_raise_instability_once() {
        let conn = Arc::new(FakeConnector {
            fail: true,
            ..FakeConnector::default()
        });
        let s = supervisor(conn.clone(), Arc::new(Recorder::default()));
        let unstable = Arc::new(AtomicU32::new(0));
        let u = unstable.clone();
        s.subscribe(move |ev| {
            if let StreamEvent::Instability { consecutive_failures, .. } = ev {
                assert_eq!(*consecutive_failures, 3);
                u.fetch_add(1, Ordering::SeqCst);
            }
        });
        s.start();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(conn.attempts() >= 4);
        assert_eq!(unstable.load(Ordering::SeqCst), 1);
        s.stop().await;
        assert_eq!(s.state(), StreamState::Closed);
    }
}
