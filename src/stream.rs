//! External event stream reconciliation.
//!
//! Manages the connection to the agent runtime's push stream: connect,
//! reconnect with exponential backoff, a bounded newest-first buffer of
//! received webhook events (deduplicated by event id), and forwarding of
//! accepted events into the tracker's ingestion port. The transport is a
//! trait so the reconciler stays agnostic of how messages arrive; the
//! bundled implementation reads newline-delimited JSON over TCP.

use crate::config::TrackerConfig;
use crate::ingest::LifecycleEvent;
use crate::status::AgentStatus;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Where accepted stream events are delivered.
pub trait EventSink: Send + Sync + 'static {
    fn deliver(&self, event: &LifecycleEvent);
}

impl<S: EventSink> EventSink for Arc<S> {
    fn deliver(&self, event: &LifecycleEvent) {
        (**self).deliver(event);
    }
}

/// A way of opening the event stream.
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    type Conn: StreamConnection;

    async fn connect(&self) -> Result<Self::Conn>;
}

/// One open stream connection.
#[async_trait]
pub trait StreamConnection: Send {
    /// The next message, or `None` when the peer closes the stream.
    async fn next_message(&mut self) -> Result<Option<String>>;
}

/// Newline-delimited JSON over TCP.
pub struct TcpTransport {
    addr: String,
}

impl TcpTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl StreamTransport for TcpTransport {
    type Conn = TcpConnection;

    async fn connect(&self) -> Result<TcpConnection> {
        let stream = TcpStream::connect(&self.addr).await?;
        Ok(TcpConnection {
            reader: BufReader::new(stream),
        })
    }
}

pub struct TcpConnection {
    reader: BufReader<TcpStream>,
}

#[async_trait]
impl StreamConnection for TcpConnection {
    async fn next_message(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).await?;
        if read == 0 {
            Ok(None)
        } else {
            Ok(Some(line))
        }
    }
}

/// One received stream notification, as kept in the bounded buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    pub event_type: String,
    pub agent_name: String,
    pub success: bool,
    pub received_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

impl WebhookEvent {
    fn from_lifecycle(event: &LifecycleEvent) -> Self {
        let success = AgentStatus::parse(&event.status)
            .map(|s| !matches!(s, AgentStatus::Failed | AgentStatus::Timeout))
            .unwrap_or(false);
        Self {
            id: event
                .event_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            event_type: event.status.clone(),
            agent_name: event.agent_id.clone(),
            success,
            received_at: Utc::now(),
            error_message: event.error_message.clone(),
        }
    }
}

/// Observable connection state plus the event buffer, shared between the
/// connection task and the handle.
struct StreamState {
    connected: bool,
    error: Option<String>,
    connection_count: u64,
    /// Newest first; bounded at `max_events`.
    events: VecDeque<WebhookEvent>,
    max_events: usize,
}

impl StreamState {
    fn new(max_events: usize) -> Self {
        Self {
            connected: false,
            error: None,
            connection_count: 0,
            events: VecDeque::new(),
            max_events: max_events.max(1),
        }
    }

    /// Inserts at the front, evicting the oldest on overflow. Returns
    /// false when an event with the same id is already buffered.
    fn record(&mut self, event: WebhookEvent) -> bool {
        if self.events.iter().any(|e| e.id == event.id) {
            return false;
        }
        self.events.push_front(event);
        self.events.truncate(self.max_events);
        true
    }
}

type SharedState = Arc<Mutex<StreamState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, StreamState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

enum StreamCommand {
    Reconnect,
}

/// Handle to a running stream reconciler. Dropping it stops the
/// connection task and discards the event buffer.
pub struct StreamHandle {
    state: SharedState,
    cmd_tx: mpsc::UnboundedSender<StreamCommand>,
}

impl StreamHandle {
    pub fn connected(&self) -> bool {
        lock(&self.state).connected
    }

    pub fn error(&self) -> Option<String> {
        lock(&self.state).error.clone()
    }

    pub fn connection_count(&self) -> u64 {
        lock(&self.state).connection_count
    }

    /// Buffered events, newest first.
    pub fn events(&self) -> Vec<WebhookEvent> {
        lock(&self.state).events.iter().cloned().collect()
    }

    pub fn last_event(&self) -> Option<WebhookEvent> {
        lock(&self.state).events.front().cloned()
    }

    /// Forces an immediate reconnect attempt and resets the backoff. An
    /// in-flight connection attempt is cancelled cleanly.
    pub fn reconnect(&self) {
        let _ = self.cmd_tx.send(StreamCommand::Reconnect);
    }

    /// Empties the event buffer without touching the connection.
    pub fn clear_events(&self) {
        lock(&self.state).events.clear();
    }
}

/// Spawns the connection task. Requires a running tokio runtime.
pub(crate) fn spawn<T, S>(transport: T, sink: S, config: &TrackerConfig) -> StreamHandle
where
    T: StreamTransport,
    S: EventSink,
{
    let state: SharedState = Arc::new(Mutex::new(StreamState::new(config.max_events)));
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_loop(
        transport,
        sink,
        state.clone(),
        cmd_rx,
        config.backoff_base(),
        config.backoff_max(),
    ));
    StreamHandle { state, cmd_tx }
}

const MAX_BACKOFF_EXPONENT: u32 = 10;

fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(MAX_BACKOFF_EXPONENT));
    base.saturating_mul(factor).min(max)
}

enum ReadEnd {
    /// Connection lost; reconnect after backoff.
    Lost(String),
    /// Manual reconnect requested; reconnect immediately.
    Manual,
    /// Handle dropped; stop the task.
    Shutdown,
}

async fn run_loop<T, S>(
    transport: T,
    sink: S,
    state: SharedState,
    mut cmd_rx: mpsc::UnboundedReceiver<StreamCommand>,
    backoff_base: Duration,
    backoff_max: Duration,
) where
    T: StreamTransport,
    S: EventSink,
{
    let mut attempt: u32 = 0;

    loop {
        let connect_result = tokio::select! {
            result = transport.connect() => result,
            cmd = cmd_rx.recv() => match cmd {
                Some(StreamCommand::Reconnect) => {
                    attempt = 0;
                    continue;
                }
                None => return,
            },
        };

        match connect_result {
            Ok(mut conn) => {
                attempt = 0;
                {
                    let mut shared = lock(&state);
                    shared.connected = true;
                    shared.error = None;
                    shared.connection_count += 1;
                }
                tracing::info!("event stream connected");

                match read_loop(&mut conn, &sink, &state, &mut cmd_rx).await {
                    ReadEnd::Manual => {
                        lock(&state).connected = false;
                        continue;
                    }
                    ReadEnd::Shutdown => {
                        lock(&state).connected = false;
                        return;
                    }
                    ReadEnd::Lost(reason) => {
                        tracing::warn!(reason = %reason, "event stream disconnected");
                        let mut shared = lock(&state);
                        shared.connected = false;
                        shared.error = Some(reason);
                    }
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "event stream connection failed");
                lock(&state).error = Some(err.to_string());
            }
        }

        let delay = backoff_delay(attempt, backoff_base, backoff_max);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            cmd = cmd_rx.recv() => match cmd {
                Some(StreamCommand::Reconnect) => attempt = 0,
                None => return,
            },
        }
    }
}

async fn read_loop<C, S>(
    conn: &mut C,
    sink: &S,
    state: &SharedState,
    cmd_rx: &mut mpsc::UnboundedReceiver<StreamCommand>,
) -> ReadEnd
where
    C: StreamConnection,
    S: EventSink,
{
    loop {
        tokio::select! {
            message = conn.next_message() => match message {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        handle_message(line, sink, state);
                    }
                }
                Ok(None) => return ReadEnd::Lost("stream closed by peer".to_string()),
                Err(err) => return ReadEnd::Lost(err.to_string()),
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(StreamCommand::Reconnect) => return ReadEnd::Manual,
                None => return ReadEnd::Shutdown,
            },
        }
    }
}

fn handle_message<S: EventSink>(line: &str, sink: &S, state: &SharedState) {
    match serde_json::from_str::<LifecycleEvent>(line) {
        Ok(event) => {
            let recorded = lock(state).record(WebhookEvent::from_lifecycle(&event));
            if recorded {
                sink.deliver(&event);
            } else {
                tracing::debug!(
                    agent_id = %event.agent_id,
                    "dropping stream event already in the buffer"
                );
            }
        }
        Err(err) => {
            // A malformed message does not cost the connection.
            tracing::warn!(error = %err, "unparseable stream message");
            lock(state).error = Some(format!("parse error: {}", err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    enum Scripted {
        Connect { lines: Vec<String>, hold_open: bool },
        Fail(String),
        Hang,
    }

    struct ScriptedTransport {
        script: Mutex<VecDeque<Scripted>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Scripted>) -> Self {
            Self {
                script: Mutex::new(script.into_iter().collect()),
            }
        }
    }

    #[async_trait]
    impl StreamTransport for ScriptedTransport {
        type Conn = ScriptedConn;

        async fn connect(&self) -> Result<ScriptedConn> {
            let next = self
                .script
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            match next {
                Some(Scripted::Connect { lines, hold_open }) => Ok(ScriptedConn {
                    lines: lines.into_iter().collect(),
                    hold_open,
                }),
                Some(Scripted::Fail(message)) => Err(anyhow::anyhow!(message)),
                Some(Scripted::Hang) | None => futures::future::pending().await,
            }
        }
    }

    struct ScriptedConn {
        lines: VecDeque<String>,
        hold_open: bool,
    }

    #[async_trait]
    impl StreamConnection for ScriptedConn {
        async fn next_message(&mut self) -> Result<Option<String>> {
            match self.lines.pop_front() {
                Some(line) => Ok(Some(line)),
                None if self.hold_open => futures::future::pending().await,
                None => Ok(None),
            }
        }
    }

    #[derive(Default)]
    struct CollectingSink {
        events: Mutex<Vec<LifecycleEvent>>,
    }

    impl CollectingSink {
        fn count(&self) -> usize {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len()
        }
    }

    impl EventSink for CollectingSink {
        fn deliver(&self, event: &LifecycleEvent) {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event.clone());
        }
    }

    fn wire_event(agent_id: &str, status: &str, event_id: &str, offset_secs: i64) -> String {
        let event = LifecycleEvent {
            agent_id: agent_id.to_string(),
            status: status.to_string(),
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap()
                + ChronoDuration::seconds(offset_secs),
            event_id: Some(event_id.to_string()),
            progress_percentage: None,
            error_message: None,
            retry_count: None,
            execution_time_ms: None,
        };
        serde_json::to_string(&event).unwrap()
    }

    async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    fn test_config(max_events: usize, backoff_base_secs: u64) -> TrackerConfig {
        TrackerConfig {
            max_events,
            backoff_base_secs,
            backoff_max_secs: 1,
            ..TrackerConfig::default()
        }
    }

    #[tokio::test]
    async fn delivers_events_and_tracks_connection_state() {
        let transport = ScriptedTransport::new(vec![Scripted::Connect {
            lines: vec![
                wire_event("geo_audit", "starting", "e1", 0),
                wire_event("geo_audit", "running", "e2", 1),
            ],
            hold_open: true,
        }]);
        let sink = Arc::new(CollectingSink::default());
        let handle = spawn(transport, sink.clone(), &test_config(50, 0));

        wait_until("both events", || sink.count() == 2).await;
        assert!(handle.connected());
        assert_eq!(handle.connection_count(), 1);
        assert_eq!(handle.error(), None);

        // Newest first.
        let events = handle.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, "e2");
        assert_eq!(events[1].id, "e1");
        assert_eq!(handle.last_event().unwrap().id, "e2");
        assert!(events[0].success);
    }

    #[tokio::test]
    async fn duplicate_event_ids_are_not_reingested() {
        let transport = ScriptedTransport::new(vec![Scripted::Connect {
            lines: vec![
                wire_event("geo_audit", "completed", "abc", 0),
                wire_event("geo_audit", "completed", "abc", 0),
            ],
            hold_open: true,
        }]);
        let sink = Arc::new(CollectingSink::default());
        let handle = spawn(transport, sink.clone(), &test_config(50, 0));

        wait_until("first event", || sink.count() >= 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.count(), 1);
        assert_eq!(handle.events().len(), 1);
    }

    #[tokio::test]
    async fn ring_buffer_evicts_the_oldest() {
        let lines: Vec<String> = (0..5)
            .map(|n| wire_event("geo_audit", "running", &format!("e{}", n), n))
            .collect();
        let transport = ScriptedTransport::new(vec![Scripted::Connect {
            lines,
            hold_open: true,
        }]);
        let sink = Arc::new(CollectingSink::default());
        let handle = spawn(transport, sink.clone(), &test_config(3, 0));

        wait_until("all five events", || sink.count() == 5).await;
        let events = handle.events();
        assert_eq!(events.len(), 3);
        let ids: Vec<&str> = events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["e4", "e3", "e2"]);
    }

    #[tokio::test]
    async fn reconnects_after_stream_loss() {
        let transport = ScriptedTransport::new(vec![
            Scripted::Connect {
                lines: vec![wire_event("geo_audit", "starting", "e1", 0)],
                hold_open: false,
            },
            Scripted::Connect {
                lines: vec![],
                hold_open: true,
            },
        ]);
        let sink = Arc::new(CollectingSink::default());
        let handle = spawn(transport, sink.clone(), &test_config(50, 0));

        wait_until("second connection", || handle.connection_count() == 2).await;
        assert!(handle.connected());
        assert_eq!(handle.error(), None);
        assert_eq!(sink.count(), 1);
        // The buffer survives the reconnect.
        assert_eq!(handle.events().len(), 1);
    }

    #[tokio::test]
    async fn connect_failure_surfaces_as_error_then_retries() {
        let transport = ScriptedTransport::new(vec![
            Scripted::Fail("connection refused".to_string()),
            Scripted::Connect {
                lines: vec![],
                hold_open: true,
            },
        ]);
        let sink = Arc::new(CollectingSink::default());
        let handle = spawn(transport, sink, &test_config(50, 1));

        wait_until("error surfaced", || handle.error().is_some()).await;
        assert!(!handle.connected());
        assert!(handle.error().unwrap().contains("connection refused"));

        wait_until("recovery", || handle.connected()).await;
        assert_eq!(handle.error(), None);
        assert_eq!(handle.connection_count(), 1);
    }

    #[tokio::test]
    async fn manual_reconnect_drops_the_current_connection() {
        let transport = ScriptedTransport::new(vec![
            Scripted::Connect {
                lines: vec![],
                hold_open: true,
            },
            Scripted::Connect {
                lines: vec![wire_event("geo_audit", "starting", "after", 0)],
                hold_open: true,
            },
        ]);
        let sink = Arc::new(CollectingSink::default());
        let handle = spawn(transport, sink.clone(), &test_config(50, 1));

        wait_until("first connection", || handle.connection_count() == 1).await;
        handle.reconnect();
        wait_until("second connection", || handle.connection_count() == 2).await;
        wait_until("event from the new connection", || sink.count() == 1).await;
    }

    #[tokio::test]
    async fn reconnect_cancels_an_in_flight_attempt() {
        let transport = ScriptedTransport::new(vec![
            Scripted::Hang,
            Scripted::Connect {
                lines: vec![],
                hold_open: true,
            },
        ]);
        let sink = Arc::new(CollectingSink::default());
        let handle = spawn(transport, sink, &test_config(50, 1));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.connected());
        handle.reconnect();
        wait_until("connection after cancel", || handle.connected()).await;
        assert_eq!(handle.connection_count(), 1);
    }

    #[tokio::test]
    async fn parse_errors_keep_the_connection_up() {
        let transport = ScriptedTransport::new(vec![Scripted::Connect {
            lines: vec![
                "not json at all".to_string(),
                wire_event("geo_audit", "starting", "e1", 0),
            ],
            hold_open: true,
        }]);
        let sink = Arc::new(CollectingSink::default());
        let handle = spawn(transport, sink.clone(), &test_config(50, 0));

        wait_until("the valid event", || sink.count() == 1).await;
        assert!(handle.connected());
        assert!(handle.error().unwrap().contains("parse error"));
    }

    #[tokio::test]
    async fn clear_events_leaves_the_connection_alone() {
        let transport = ScriptedTransport::new(vec![Scripted::Connect {
            lines: vec![wire_event("geo_audit", "starting", "e1", 0)],
            hold_open: true,
        }]);
        let sink = Arc::new(CollectingSink::default());
        let handle = spawn(transport, sink.clone(), &test_config(50, 0));

        wait_until("the event", || sink.count() == 1).await;
        handle.clear_events();
        assert!(handle.events().is_empty());
        assert_eq!(handle.last_event(), None);
        assert!(handle.connected());
        assert_eq!(handle.connection_count(), 1);
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(60);
        assert_eq!(backoff_delay(0, base, max), Duration::from_secs(1));
        assert_eq!(backoff_delay(1, base, max), Duration::from_secs(2));
        assert_eq!(backoff_delay(4, base, max), Duration::from_secs(16));
        assert_eq!(backoff_delay(6, base, max), Duration::from_secs(60));
        assert_eq!(backoff_delay(40, base, max), Duration::from_secs(60));
    }
}
