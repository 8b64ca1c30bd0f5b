//! armada-core: shared types for the Armada director.
//!
//! Holds the document types the director consumes (deployment manifests,
//! cloud/runtime/CPI configs), the update policy model, the director's own
//! TOML configuration, and the desired-state resolver that folds all of
//! these into a normalized topology for the reconciler.

pub mod cloud;
pub mod config;
pub mod desired;
pub mod error;
pub mod hash;
pub mod manifest;
pub mod merge;
pub mod network;
pub mod placeholder;
pub mod update;

pub use cloud::{CloudConfig, CpiConfig, CpiEntry, RuntimeConfig};
pub use config::DirectorConfig;
pub use desired::{DesiredAz, DesiredDeployment, DesiredDisk, DesiredInstanceGroup, DesiredNetwork, resolve};
pub use error::{CoreError, CoreResult};
pub use manifest::{DeploymentManifest, InstanceGroupManifest, JobSpec, Lifecycle, PackageRef, VmResources};
pub use update::{Quantity, UpdatePolicy, UpdateStrategy, WatchTime};
