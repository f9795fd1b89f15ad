//! KDL configuration parsing for distbuild.
//!
//! Every component receives its settings through the structs in
//! [`system`] at construction time.

pub mod error;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::{
    ArtifactsConfig, DatabaseConfig, LogFormat, SchedulerConfig, ServerConfig, SigningConfig,
    SystemConfig, load_system_config, parse_system_config,
};
