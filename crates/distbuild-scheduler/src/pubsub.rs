//! Publish/subscribe transport for ephemeral request/response exchanges.
//!
//! Nothing is persisted: a message published while nobody is subscribed
//! to its channel is dropped. Every subscription first yields a
//! [`Message::Subscribed`] confirmation, then the payloads published on
//! its channel in order.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use distbuild_core::{Error, Result};
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::{OnceCell, mpsc, oneshot};
use tracing::{debug, info, warn};

/// Something delivered on a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Subscribed { channel: String },
    Payload { channel: String, data: String },
}

/// A live subscription to one channel. Dropping it unsubscribes.
pub struct Subscription {
    channel: String,
    rx: mpsc::UnboundedReceiver<Message>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    fn new(channel: &str) -> (mpsc::UnboundedSender<Message>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        // The receiver is alive, so this cannot fail.
        let _ = tx.send(Message::Subscribed {
            channel: channel.to_string(),
        });
        (
            tx,
            Self {
                channel: channel.to_string(),
                rx,
                release: None,
            },
        )
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next message, confirmations included.
    pub async fn recv(&mut self) -> Result<Message> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| Error::Disconnected(format!("subscription to {} closed", self.channel)))
    }

    /// Wait for the next payload, skipping subscribe confirmations.
    pub async fn next_payload(&mut self) -> Result<String> {
        loop {
            match self.recv().await? {
                Message::Subscribed { .. } => continue,
                Message::Payload { data, .. } => return Ok(data),
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

#[async_trait]
pub trait PubSub: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;

    /// Publish `payload` on `channel`. Returns the number of local
    /// subscribers reached where the backend can tell, otherwise 0.
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize>;
}

type Senders = HashMap<String, Vec<(u64, mpsc::UnboundedSender<Message>)>>;

/// Local subscribers by channel. A channel's entry lives exactly as long
/// as it has subscriptions.
#[derive(Debug, Default)]
struct Registry {
    channels: Mutex<Senders>,
    next_id: AtomicU64,
}

impl Registry {
    fn lock(&self) -> Result<MutexGuard<'_, Senders>> {
        self.channels
            .lock()
            .map_err(|_| Error::Unavailable("pubsub registry lock poisoned".to_string()))
    }

    /// Register a subscriber. `emptied` runs with the channel name when the
    /// channel's last subscription is dropped.
    fn subscribe<F>(self: &Arc<Self>, channel: &str, emptied: F) -> Result<Subscription>
    where
        F: FnOnce(String) + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut subscription) = Subscription::new(channel);
        self.lock()?
            .entry(channel.to_string())
            .or_default()
            .push((id, tx));

        let registry = Arc::downgrade(self);
        let name = channel.to_string();
        subscription.release = Some(Box::new(move || {
            if let Some(registry) = registry.upgrade() {
                if registry.remove(&name, id) {
                    emptied(name);
                }
            }
        }));
        Ok(subscription)
    }

    /// Returns true when this was the channel's last subscriber.
    fn remove(&self, channel: &str, id: u64) -> bool {
        let Ok(mut channels) = self.channels.lock() else {
            return false;
        };
        let Some(senders) = channels.get_mut(channel) else {
            return false;
        };
        senders.retain(|(sid, _)| *sid != id);
        if senders.is_empty() {
            channels.remove(channel);
            return true;
        }
        false
    }

    fn deliver(&self, channel: &str, data: &str) -> Result<usize> {
        let mut channels = self.lock()?;
        let Some(senders) = channels.get_mut(channel) else {
            return Ok(0);
        };
        senders.retain(|(_, tx)| {
            tx.send(Message::Payload {
                channel: channel.to_string(),
                data: data.to_string(),
            })
            .is_ok()
        });
        Ok(senders.len())
    }

    fn channel_count(&self) -> usize {
        self.channels.lock().map(|c| c.len()).unwrap_or(0)
    }
}

/// In-process broadcast.
#[derive(Debug, Default)]
pub struct MemoryPubSub {
    registry: Arc<Registry>,
}

impl MemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of channels with at least one live subscription.
    pub fn channel_count(&self) -> usize {
        self.registry.channel_count()
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        self.registry.subscribe(channel, |_| {})
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        self.registry.deliver(channel, payload)
    }
}

enum ListenCommand {
    Listen {
        channel: String,
        done: oneshot::Sender<Result<()>>,
    },
    Unlisten(String),
}

/// PostgreSQL LISTEN/NOTIFY.
///
/// All subscriptions share one listener connection, opened on the first
/// subscribe. A background task issues LISTEN/UNLISTEN as channels gain
/// their first or lose their last subscriber and routes notifications to
/// local subscribers by channel name.
pub struct PgNotifyPubSub {
    pool: PgPool,
    registry: Arc<Registry>,
    listener: OnceCell<mpsc::UnboundedSender<ListenCommand>>,
    max_payload_bytes: usize,
}

impl PgNotifyPubSub {
    pub fn new(pool: PgPool, max_payload_bytes: usize) -> Self {
        Self {
            pool,
            registry: Arc::new(Registry::default()),
            listener: OnceCell::new(),
            max_payload_bytes,
        }
    }

    async fn commands(&self) -> Result<&mpsc::UnboundedSender<ListenCommand>> {
        self.listener
            .get_or_try_init(|| async {
                let listener = PgListener::connect_with(&self.pool)
                    .await
                    .map_err(|e| Error::Unavailable(format!("listener connect failed: {}", e)))?;
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(route_notifications(listener, rx, Arc::downgrade(&self.registry)));
                info!("Started shared notification listener");
                Ok::<_, Error>(tx)
            })
            .await
    }
}

async fn route_notifications(
    mut listener: PgListener,
    mut commands: mpsc::UnboundedReceiver<ListenCommand>,
    registry: std::sync::Weak<Registry>,
) {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                None => break,
                Some(ListenCommand::Listen { channel, done }) => {
                    let listened = listener
                        .listen(&channel)
                        .await
                        .map_err(|e| Error::Unavailable(format!("LISTEN {} failed: {}", channel, e)));
                    let _ = done.send(listened);
                }
                Some(ListenCommand::Unlisten(channel)) => {
                    if let Err(e) = listener.unlisten(&channel).await {
                        warn!(%channel, error = %e, "UNLISTEN failed");
                    }
                }
            },
            notification = listener.recv() => match notification {
                Ok(notification) => {
                    let Some(registry) = registry.upgrade() else {
                        break;
                    };
                    if let Err(e) = registry.deliver(notification.channel(), notification.payload()) {
                        warn!(channel = %notification.channel(), error = %e, "Dropped notification");
                    }
                }
                Err(e) => {
                    // The listener reconnects and re-listens on the next recv.
                    warn!(error = %e, "Listener connection lost");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            },
        }
    }
    debug!("Notification listener stopped");
}

#[async_trait]
impl PubSub for PgNotifyPubSub {
    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let commands = self.commands().await?;

        // Register before LISTEN completes so nothing sent after this call
        // returns can be missed.
        let unlisten = commands.clone();
        let subscription = self.registry.subscribe(channel, move |name| {
            let _ = unlisten.send(ListenCommand::Unlisten(name));
        })?;

        let (done, listened) = oneshot::channel();
        commands
            .send(ListenCommand::Listen {
                channel: channel.to_string(),
                done,
            })
            .map_err(|_| Error::Unavailable("notification listener stopped".to_string()))?;
        listened
            .await
            .map_err(|_| Error::Unavailable("notification listener stopped".to_string()))??;
        Ok(subscription)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        if payload.len() > self.max_payload_bytes {
            return Err(Error::Validation(format!(
                "payload of {} bytes exceeds the {} byte limit",
                payload.len(),
                self.max_payload_bytes
            )));
        }
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Unavailable(format!("NOTIFY {} failed: {}", channel, e)))?;
        Ok(0)
    }
}
