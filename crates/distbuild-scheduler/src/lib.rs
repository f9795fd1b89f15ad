//! Task coordination for distbuild.
//!
//! Hands pending tasks to polling workers under exclusive leases, applies
//! completion reports, reclaims abandoned leases and runs the ephemeral
//! sign-request channel. All status transitions go through the task store,
//! which guards each one with a compare-and-swap on status and epoch.

pub mod artifacts;
pub mod background;
pub mod builds;
pub mod cleanup;
pub mod completion;
pub mod coordinator;
pub mod errata;
pub mod products;
pub mod pubsub;
pub mod sign_tasks;
pub mod signing;

pub use artifacts::{HttpArtifactStore, MemoryArtifactStore};
pub use background::{BackgroundJob, BackgroundQueue, BackgroundWorker};
pub use builds::BuildService;
pub use cleanup::LeaseSweeper;
pub use completion::{CompletionHandler, effects_for};
pub use coordinator::{AssignmentCoordinator, PingOutcome};
pub use errata::{ErrataReleaser, ErrataService};
pub use products::{ProductAssembler, ProductService};
pub use pubsub::{MemoryPubSub, Message, PgNotifyPubSub, PubSub, Subscription};
pub use sign_tasks::SignTaskService;
pub use signing::{SignHandler, SignRequester, SignResponder};

/// Convert a configured interval to a timestamp offset.
pub(crate) fn offset(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis().min(i64::MAX as u128) as i64)
}
