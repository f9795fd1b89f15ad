//! HTTP and WebSocket server for distbuild.
//!
//! Clients submit builds, sign tasks, products and errata records; worker
//! nodes poll for tasks, report completions and serve signing requests
//! over a WebSocket.

pub mod error;
pub mod routes;
pub mod state;
pub mod ws;

pub use state::{AppState, Backends, Workers};
