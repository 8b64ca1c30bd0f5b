//! armada-director: the deployment director.
//!
//! - [`Director`]: the operator surface; owns the store, locks, CPIs and
//!   task runner.
//! - [`Deployer`]: one deploy, state command or deletion under the
//!   deployment lock.
//! - [`Planner`] / [`InstanceUpdater`]: the instance reconciler and update
//!   scheduler (canaries, max-in-flight, AZ batches, serial groups).
//! - [`DiskManager`]: persistent disks, orphaning, snapshots.
//! - [`VariableTracker`]: secret resolution and variable-set pinning.
//! - [`PackageCompiler`]: dependency-ordered package compilation.

pub mod agent;
pub mod compiler;
pub mod deployer;
pub mod director;
pub mod disks;
pub mod error;
pub mod ip;
pub mod lifecycle;
pub mod planner;
pub mod tasks;
pub mod updater;
pub mod variables;
pub mod vm;

pub use agent::{AgentClient, AgentError, AgentFactory, DummyAgentHub, Script};
pub use compiler::{CompileReport, PackageCompiler};
pub use deployer::{ChangeReport, DeployOptions, DeployReport, Deployer};
pub use director::{CleanupReport, ConfigDiff, ConfigUpload, Director};
pub use disks::{DiskDeletion, DiskManager};
pub use error::{DirectorError, DirectorResult};
pub use lifecycle::{Operation, VmStatus};
pub use planner::{Change, DeploymentPlan, InstanceSelector, PlanOptions, Planner};
pub use tasks::{Cancellation, TaskHandle, TaskRunner};
pub use updater::{InstanceUpdater, SkipDrain};
pub use variables::{MemorySecretStore, SecretStore, SecretVersion, VariableTracker};
