//! Process plugin deployment.
//!
//! Reconciles what the loaded plugin set wants deployed against the process
//! registry and the remote artifact store, and converges them with one
//! atomic batch per pass.

pub mod apply;
pub mod batch;
pub mod config;
pub mod deployer;
pub mod error;
pub mod existence;
pub mod merge;
pub mod plugins;
pub mod ports;
pub mod registry;
pub mod retry;
pub mod state;
pub mod store_memory;
pub mod types;

pub use config::DeployConfig;
pub use deployer::{DeploymentPlan, DeploymentReport, Deployer};
pub use error::{DeployError, Result};
pub use state::{LifecycleState, StateChange};
pub use types::{ArtifactIdentity, DeclaredArtifact, PluginProcess, ProcessKey, ProcessPlugin, ResourceKind};
