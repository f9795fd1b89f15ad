//! Core domain types and traits for the distbuild orchestration backend.
//!
//! This crate contains:
//! - Resource identifiers and the error taxonomy
//! - Tasks (build, sign, key generation), their status lifecycle and
//!   the capability model used to match tasks to workers
//! - Completion reports and their validation
//! - Build, errata and product records
//! - Wire types for the ephemeral sign-request channel
//! - The artifact store port

pub mod artifact;
pub mod build;
pub mod errata;
pub mod error;
pub mod id;
pub mod product;
pub mod report;
pub mod signing;
pub mod task;

pub use error::{Error, Result};
pub use id::ResourceId;
