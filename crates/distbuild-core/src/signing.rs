//! Wire types for the ephemeral sign-request channel.
//!
//! A requester publishes a [`SignRequest`] on the shared request channel
//! and waits for exactly one reply on the channel named by the request's
//! `task_id`. Replies are opaque JSON.

use serde::{Deserialize, Serialize};

/// Default name of the shared request channel.
pub const DEFAULT_SIGN_CHANNEL: &str = "small_sign_tasks";

/// A request for a detached signature over a small payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignRequest {
    /// Correlation id and reply channel name.
    pub task_id: String,
    pub content: String,
    pub key_id: String,
    pub sig_type: String,
}

/// Body of a synchronous sign call, before a correlation id is assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSignRequest {
    pub content: String,
    pub pgp_keyid: String,
    pub sig_type: String,
}

impl SyncSignRequest {
    pub fn into_request(self, task_id: String) -> SignRequest {
        SignRequest {
            task_id,
            content: self.content,
            key_id: self.pgp_keyid,
            sig_type: self.sig_type,
        }
    }
}
