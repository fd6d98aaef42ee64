//! Feed Reconnection Tests
//!
//! Drives the connection manager against a scripted in-memory connector with a
//! paused clock. Verifies the subscription handshake, reconnection after
//! failures and clean closes, and that bad messages never stop the loop.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use whalescope_ingestor::decoder::BlockNotification;
use whalescope_ingestor::feed::{
    ConnectionManager, ConnectionState, FeedConfig, FeedConnector, FeedError, FeedTransport, NotificationHandler,
};

const DELAY: Duration = Duration::from_secs(5);

/// What the connector does on one connection attempt
enum Attempt {
    /// Refuse the connection
    Fail,
    /// Never complete the connection
    Hang,
    /// Accept and deliver these frames, then close or stay open
    Session { frames: Vec<String>, hold_open: bool },
}

/// Connector that plays back a script of attempts
#[derive(Clone)]
struct ScriptedConnector {
    script: Arc<Mutex<VecDeque<Attempt>>>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl ScriptedConnector {
    fn new(script: Vec<Attempt>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

struct ScriptedTransport {
    frames: VecDeque<String>,
    hold_open: bool,
    sent: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl FeedConnector for ScriptedConnector {
    type Transport = ScriptedTransport;

    async fn connect(&self, _url: &str) -> Result<ScriptedTransport, FeedError> {
        let attempt = self.script.lock().unwrap().pop_front();
        match attempt {
            Some(Attempt::Session { frames, hold_open }) => Ok(ScriptedTransport {
                frames: frames.into(),
                hold_open,
                sent: self.sent.clone(),
            }),
            Some(Attempt::Hang) => std::future::pending().await,
            // An exhausted script keeps refusing
            Some(Attempt::Fail) | None => Err(FeedError::ConnectionFailed("connection refused".to_string())),
        }
    }
}

#[async_trait]
impl FeedTransport for ScriptedTransport {
    async fn send(&mut self, text: String) -> Result<(), FeedError> {
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, FeedError>> {
        match self.frames.pop_front() {
            Some(frame) => Some(Ok(frame)),
            None if self.hold_open => std::future::pending().await,
            None => None,
        }
    }
}

/// Handler that forwards every notification to the test
struct ForwardingHandler {
    tx: mpsc::UnboundedSender<BlockNotification>,
}

#[async_trait]
impl NotificationHandler for ForwardingHandler {
    async fn handle(&mut self, notification: BlockNotification) {
        let _ = self.tx.send(notification);
    }
}

struct RunningFeed {
    notifications: mpsc::UnboundedReceiver<BlockNotification>,
    state: tokio::sync::watch::Receiver<ConnectionState>,
    shutdown: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<ConnectionManager<ScriptedConnector>>,
}

impl RunningFeed {
    async fn stop(self) -> ConnectionManager<ScriptedConnector> {
        let _ = self.shutdown.send(());
        self.task.await.unwrap()
    }
}

fn start(connector: ScriptedConnector) -> RunningFeed {
    let mut manager = ConnectionManager::new(connector, FeedConfig::with_url("wss://feed.test/inv"));
    let state = manager.subscribe_state();
    let (tx, notifications) = mpsc::unbounded_channel();
    let (shutdown, shutdown_rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        let mut handler = ForwardingHandler { tx };
        manager
            .run_until(&mut handler, async {
                let _ = shutdown_rx.await;
            })
            .await;
        manager
    });

    RunningFeed {
        notifications,
        state,
        shutdown,
        task,
    }
}

fn block_frame(hash_byte: char, height: u64) -> String {
    let hash: String = std::iter::repeat(hash_byte).take(64).collect();
    format!(r#"{{"op":"block","x":{{"hash":"{}","height":{},"nTx":2}}}}"#, hash, height)
}

// ==================== Reconnection tests ====================

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_failures_with_fixed_delay() {
    let connector = ScriptedConnector::new(vec![
        Attempt::Fail,
        Attempt::Fail,
        Attempt::Fail,
        Attempt::Session {
            frames: vec![block_frame('a', 840000)],
            hold_open: true,
        },
    ]);
    let started = Instant::now();
    let mut feed = start(connector.clone());

    let notification = feed.notifications.recv().await.unwrap();
    assert_eq!(notification.height, Some(840000));
    assert!(started.elapsed() >= DELAY * 3, "elapsed {:?}", started.elapsed());
    assert_eq!(*feed.state.borrow(), ConnectionState::Receiving);

    let manager = feed.stop().await;
    assert_eq!(manager.connection_attempts(), 4);
    assert_eq!(manager.consecutive_failures(), 0);
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    // Only the successful session sends the handshake, ping first
    assert_eq!(connector.sent(), vec![r#"{"op":"ping_block"}"#, r#"{"op":"blocks_sub"}"#]);
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_clean_close() {
    let connector = ScriptedConnector::new(vec![
        Attempt::Session {
            frames: vec![block_frame('a', 1)],
            hold_open: false,
        },
        Attempt::Session {
            frames: vec![block_frame('b', 2)],
            hold_open: true,
        },
    ]);
    let mut feed = start(connector.clone());

    let first = feed.notifications.recv().await.unwrap();
    let closed_at = Instant::now();
    let second = feed.notifications.recv().await.unwrap();

    assert_eq!(first.height, Some(1));
    assert_eq!(second.height, Some(2));
    assert!(closed_at.elapsed() >= DELAY);

    let manager = feed.stop().await;
    assert_eq!(manager.connection_attempts(), 2);
    // Every session subscribes again
    assert_eq!(connector.sent().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_counts_as_failure() {
    let connector = ScriptedConnector::new(vec![
        Attempt::Hang,
        Attempt::Session {
            frames: vec![block_frame('c', 3)],
            hold_open: true,
        },
    ]);
    let started = Instant::now();
    let mut feed = start(connector);

    let notification = feed.notifications.recv().await.unwrap();
    assert_eq!(notification.height, Some(3));
    // 5s connect timeout plus the 5s reconnect delay
    assert!(started.elapsed() >= Duration::from_secs(10));

    let manager = feed.stop().await;
    assert_eq!(manager.connection_attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_keeps_retrying_while_feed_is_down() {
    let connector = ScriptedConnector::new(Vec::new());
    let feed = start(connector.clone());

    tokio::time::sleep(DELAY * 10 + Duration::from_millis(1)).await;

    let manager = feed.stop().await;
    assert_eq!(manager.connection_attempts(), 11);
    assert!(connector.sent().is_empty());
}

// ==================== Message handling tests ====================

#[tokio::test(start_paused = true)]
async fn test_malformed_messages_are_dropped() {
    let connector = ScriptedConnector::new(vec![Attempt::Session {
        frames: vec![
            "not json".to_string(),
            String::new(),
            block_frame('d', 4),
        ],
        hold_open: true,
    }]);
    let mut feed = start(connector);

    let notification = feed.notifications.recv().await.unwrap();
    assert_eq!(notification.height, Some(4));

    let manager = feed.stop().await;
    assert_eq!(manager.connection_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_notifications_delivered_in_arrival_order() {
    let connector = ScriptedConnector::new(vec![Attempt::Session {
        frames: vec![block_frame('a', 10), block_frame('b', 11), block_frame('c', 12)],
        hold_open: true,
    }]);
    let mut feed = start(connector);

    let mut heights = Vec::new();
    for _ in 0..3 {
        heights.push(feed.notifications.recv().await.unwrap().height);
    }
    assert_eq!(heights, vec![Some(10), Some(11), Some(12)]);

    feed.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_non_block_envelope_is_forwarded_without_hash() {
    let connector = ScriptedConnector::new(vec![Attempt::Session {
        frames: vec![r#"{"op":"pong"}"#.to_string()],
        hold_open: true,
    }]);
    let mut feed = start(connector);

    let notification = feed.notifications.recv().await.unwrap();
    assert!(!notification.is_block());
    assert_eq!(notification.block_hash(), None);

    feed.stop().await;
}
