//! Connection manager with automatic reconnection to the car

use crate::command::DispatcherHandle;
use crate::transport::{Connection, LinkConnector};
use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Events emitted by the connection manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A link to the car is up and handed to the dispatcher
    Connected {
        transport: &'static str,
        peer: String,
    },
    /// The car went away; queued commands were dropped
    Disconnected { reason: String },
    /// A connection attempt failed; another follows after the backoff
    ConnectionFailed { reason: String },
}

/// Configuration for the connection manager
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Reconnection delay (initial)
    pub reconnect_delay: Duration,
    /// Maximum reconnection delay
    pub max_reconnect_delay: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Pause between the stop command and closing the link on shutdown
    pub settle_delay: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            settle_delay: Duration::from_millis(100),
        }
    }
}

/// Keeps the dispatcher supplied with a live link
pub struct ConnectionManager {
    config: LinkConfig,
    dispatcher: DispatcherHandle,
    event_rx: mpsc::Receiver<ConnectionEvent>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ConnectionManager {
    /// Create a new connection manager and start the connection loop
    pub fn new(
        config: LinkConfig,
        connector: Arc<dyn LinkConnector>,
        dispatcher: DispatcherHandle,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel::<ConnectionEvent>(100);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(connection_loop(
            config.clone(),
            connector,
            dispatcher.clone(),
            event_tx,
            shutdown_rx,
        ));

        Self {
            config,
            dispatcher,
            event_rx,
            shutdown_tx,
            task,
        }
    }

    /// Receive the next connection event
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.event_rx.recv().await
    }

    /// Stop reconnecting, halt the car and close the link
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            warn!("[LINK] Connection loop ended abnormally: {}", e);
        }

        match self.dispatcher.release(true).await? {
            Some(link) => {
                // Give the car a moment to act on the stop before the radio drops
                sleep(self.config.settle_delay).await;
                link.close()
                    .await
                    .map_err(|e| anyhow!("Closing {} link failed: {}", link.name(), e))?;
                info!("[LINK] Disconnected from car");
            }
            None => info!("[LINK] No active link to close"),
        }
        Ok(())
    }
}

/// Main connection loop with reconnection logic
async fn connection_loop(
    config: LinkConfig,
    connector: Arc<dyn LinkConnector>,
    dispatcher: DispatcherHandle,
    event_tx: mpsc::Sender<ConnectionEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut reconnect_delay = config.reconnect_delay;

    loop {
        debug!("[LINK] Connecting via {}", connector.name());
        let attempt = tokio::select! {
            result = timeout(config.connect_timeout, connector.connect()) => result,
            _ = shutdown_rx.changed() => return,
        };

        match attempt {
            Ok(Ok(connection)) => {
                // Connected successfully
                reconnect_delay = config.reconnect_delay;

                let Connection {
                    link,
                    disconnected,
                    peer,
                } = connection;
                let transport = link.name();
                info!("[LINK] Connected to {} via {}", peer, transport);

                if dispatcher.on_connect(link).is_err() {
                    error!("[LINK] Dispatcher stopped, giving up on the link");
                    return;
                }
                let _ = event_tx
                    .send(ConnectionEvent::Connected { transport, peer })
                    .await;

                // The session stays with the dispatcher on shutdown so it can send the stop
                let reason = tokio::select! {
                    reason = disconnected => {
                        reason.unwrap_or_else(|_| "disconnect watcher dropped".into())
                    }
                    _ = shutdown_rx.changed() => return,
                };

                warn!("[LINK] Lost {} link: {}", transport, reason);
                let _ = dispatcher.on_disconnect(reason.clone());
                let _ = event_tx
                    .send(ConnectionEvent::Disconnected { reason })
                    .await;
            }
            Ok(Err(e)) => {
                warn!("[LINK] {} connect failed: {}", connector.name(), e);
                let _ = event_tx
                    .send(ConnectionEvent::ConnectionFailed {
                        reason: e.to_string(),
                    })
                    .await;
            }
            Err(_) => {
                warn!(
                    "[LINK] {} connect timed out after {:?}",
                    connector.name(),
                    config.connect_timeout
                );
                let _ = event_tx
                    .send(ConnectionEvent::ConnectionFailed {
                        reason: format!("timed out after {:?}", config.connect_timeout),
                    })
                    .await;
            }
        }

        // Wait before reconnecting
        tokio::select! {
            _ = sleep(reconnect_delay) => {}
            _ = shutdown_rx.changed() => return,
        }

        // Exponential backoff
        reconnect_delay = std::cmp::min(reconnect_delay * 2, config.max_reconnect_delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Dispatcher;
    use crate::transport::{CommandLink, TransportError};
    use async_trait::async_trait;
    use bytes::Bytes;
    use rabbit_shared::codec::decode;
    use rabbit_shared::Encoder;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    /// Link that acknowledges every write immediately
    #[derive(Default)]
    struct RecordingLink {
        writes: Mutex<Vec<Bytes>>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl CommandLink for RecordingLink {
        async fn write(&self, payload: Bytes) -> Result<(), TransportError> {
            self.writes.lock().unwrap().push(payload);
            Ok(())
        }

        async fn close(&self) -> Result<(), TransportError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    /// Hands out prepared links in order, then fails
    #[derive(Default)]
    struct FakeConnector {
        links: Mutex<VecDeque<(Arc<RecordingLink>, oneshot::Receiver<String>)>>,
        attempts: AtomicUsize,
    }

    impl FakeConnector {
        fn prepare(&self) -> (Arc<RecordingLink>, oneshot::Sender<String>) {
            let link = Arc::new(RecordingLink::default());
            let (tx, rx) = oneshot::channel();
            self.links.lock().unwrap().push_back((link.clone(), rx));
            (link, tx)
        }
    }

    #[async_trait]
    impl LinkConnector for FakeConnector {
        async fn connect(&self) -> Result<Connection> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            match self.links.lock().unwrap().pop_front() {
                Some((link, disconnected)) => Ok(Connection {
                    link,
                    disconnected,
                    peer: format!("fake-{}", attempt),
                }),
                None => Err(anyhow!("car not found")),
            }
        }

        fn name(&self) -> &'static str {
            "fake"
        }
    }

    fn fast_config() -> LinkConfig {
        LinkConfig {
            reconnect_delay: Duration::from_millis(5),
            max_reconnect_delay: Duration::from_millis(20),
            connect_timeout: Duration::from_secs(1),
            settle_delay: Duration::from_millis(1),
        }
    }

    fn spawn_dispatcher() -> DispatcherHandle {
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        Dispatcher::spawn(Encoder::default(), event_tx)
    }

    async fn next_event(manager: &mut ConnectionManager) -> ConnectionEvent {
        timeout(Duration::from_secs(1), manager.recv())
            .await
            .expect("no connection event within 1s")
            .expect("manager closed")
    }

    #[test]
    fn test_default_config() {
        let config = LinkConfig::default();
        assert_eq!(config.reconnect_delay, Duration::from_secs(1));
        assert_eq!(config.max_reconnect_delay, Duration::from_secs(30));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.settle_delay, Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_reconnects_after_disconnect() {
        let connector = Arc::new(FakeConnector::default());
        let (_first, drop_first) = connector.prepare();
        let (_second, _drop_second) = connector.prepare();
        let dispatcher = spawn_dispatcher();
        let mut manager = ConnectionManager::new(fast_config(), connector.clone(), dispatcher.clone());

        assert_eq!(
            next_event(&mut manager).await,
            ConnectionEvent::Connected {
                transport: "recording",
                peer: "fake-1".into()
            }
        );
        assert!(dispatcher.is_connected());

        drop_first.send("out of range".into()).unwrap();
        assert_eq!(
            next_event(&mut manager).await,
            ConnectionEvent::Disconnected {
                reason: "out of range".into()
            }
        );

        assert!(matches!(
            next_event(&mut manager).await,
            ConnectionEvent::Connected { .. }
        ));
        assert!(dispatcher.is_connected());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_attempts_are_reported() {
        let connector = Arc::new(FakeConnector::default());
        let dispatcher = spawn_dispatcher();
        let mut manager = ConnectionManager::new(fast_config(), connector.clone(), dispatcher.clone());

        for _ in 0..3 {
            assert_eq!(
                next_event(&mut manager).await,
                ConnectionEvent::ConnectionFailed {
                    reason: "car not found".into()
                }
            );
        }
        assert!(!dispatcher.is_connected());
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_car_then_closes() {
        let connector = Arc::new(FakeConnector::default());
        let (link, _disconnect) = connector.prepare();
        let dispatcher = spawn_dispatcher();
        let mut manager = ConnectionManager::new(fast_config(), connector.clone(), dispatcher.clone());

        assert!(matches!(
            next_event(&mut manager).await,
            ConnectionEvent::Connected { .. }
        ));
        manager.shutdown().await.unwrap();

        assert!(link.closed.load(Ordering::SeqCst));
        let writes = link.writes.lock().unwrap();
        let last = decode(writes.last().expect("no stop written")).unwrap();
        assert_eq!(last.type_name, "running");
        assert_eq!(last.get_bool("running"), Some(false));
        assert!(!dispatcher.is_connected());
    }
}
