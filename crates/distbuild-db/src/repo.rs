//! Repository traits and implementations.

pub mod errata;
pub mod product;
pub mod task;

pub use errata::{ErrataRepo, PgErrataRepo};
pub use product::{PgProductRepo, ProductRepo};
pub use task::{
    ClaimRequest, CompletionEffect, LeaseSnapshot, PgTaskStore, RequeueGuard, TaskFilter,
    TaskStore,
};
