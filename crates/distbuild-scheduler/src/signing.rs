//! Ephemeral sign-request channel.
//!
//! A requester subscribes to a private channel named by a fresh
//! correlation id, publishes the request on the shared channel and waits
//! for exactly one reply. Responders listen on the shared channel and
//! publish each reply to the request's private channel. The shared channel
//! is broadcast, so several responders may handle the same request; the
//! work is assumed idempotent and the requester keeps the first reply.

use std::sync::Arc;

use async_trait::async_trait;
use distbuild_config::SigningConfig;
use distbuild_core::id::correlation_id;
use distbuild_core::signing::{SignRequest, SyncSignRequest};
use distbuild_core::{Error, Result};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::pubsub::PubSub;

pub struct SignRequester {
    pubsub: Arc<dyn PubSub>,
    config: SigningConfig,
}

impl SignRequester {
    pub fn new(pubsub: Arc<dyn PubSub>, config: SigningConfig) -> Self {
        Self { pubsub, config }
    }

    /// Publish a sign request and wait for its reply.
    ///
    /// Fails with `Timeout` when no reply arrives within the configured
    /// request timeout. The private subscription is released either way.
    pub async fn request(&self, request: SyncSignRequest) -> Result<Value> {
        let task_id = correlation_id();
        let request = request.into_request(task_id.clone());
        let payload = serde_json::to_string(&request)
            .map_err(|e| Error::Internal(format!("encode sign request: {}", e)))?;
        if payload.len() > self.config.max_payload_bytes {
            return Err(Error::Validation(format!(
                "sign request of {} bytes exceeds the {} byte limit",
                payload.len(),
                self.config.max_payload_bytes
            )));
        }

        let mut reply = self.pubsub.subscribe(&task_id).await?;
        self.pubsub.publish(&self.config.channel, &payload).await?;
        debug!(%task_id, key_id = %request.key_id, "Published sign request");

        let data = tokio::time::timeout(self.config.request_timeout, reply.next_payload())
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "no reply to sign request {} within {}s",
                    task_id,
                    self.config.request_timeout.as_secs()
                ))
            })??;

        serde_json::from_str(&data)
            .map_err(|e| Error::Validation(format!("malformed reply to {}: {}", task_id, e)))
    }
}

/// Does the signing work for one request.
#[async_trait]
pub trait SignHandler: Send + Sync {
    /// Produce the reply for `request`. Returning `Disconnected` stops the
    /// responder; any other error skips just this request.
    async fn handle(&self, request: &SignRequest) -> Result<Value>;
}

pub struct SignResponder {
    pubsub: Arc<dyn PubSub>,
    config: SigningConfig,
}

impl SignResponder {
    pub fn new(pubsub: Arc<dyn PubSub>, config: SigningConfig) -> Self {
        Self { pubsub, config }
    }

    /// Serve requests from the shared channel until `shutdown` flips to
    /// true or the handler reports it is disconnected.
    ///
    /// Waits are bounded by the poll interval so shutdown is noticed even
    /// when no requests arrive.
    pub async fn run(
        &self,
        handler: &dyn SignHandler,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut requests = self.pubsub.subscribe(&self.config.channel).await?;
        info!(channel = %self.config.channel, "Sign responder listening");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let data = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                next = tokio::time::timeout(self.config.poll_interval, requests.next_payload()) => {
                    match next {
                        Err(_) => {
                            debug!(channel = %self.config.channel, "No sign requests this interval");
                            continue;
                        }
                        Ok(next) => next?,
                    }
                }
            };

            let request: SignRequest = match serde_json::from_str(&data) {
                Ok(request) => request,
                Err(e) => {
                    warn!(error = %e, "Skipping malformed sign request");
                    continue;
                }
            };

            match handler.handle(&request).await {
                Ok(reply) => {
                    let reply = reply.to_string();
                    if let Err(e) = self.pubsub.publish(&request.task_id, &reply).await {
                        warn!(task_id = %request.task_id, error = %e, "Failed to publish sign reply");
                    }
                }
                Err(Error::Disconnected(reason)) => {
                    info!(task_id = %request.task_id, %reason, "Sign handler disconnected");
                    return Err(Error::Disconnected(reason));
                }
                Err(e) => {
                    warn!(task_id = %request.task_id, error = %e, "Sign request failed");
                }
            }
        }

        info!(channel = %self.config.channel, "Sign responder stopped");
        Ok(())
    }
}
