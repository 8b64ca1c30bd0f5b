//! armada-cpi: cloud provider interface for the Armada director.
//!
//! - [`CloudProvider`]: the async trait every CPI implements.
//! - [`CpiRegistry`] / [`CpiRouter`]: resolves the provider for an AZ or
//!   a recorded CPI name, once per operation.
//! - [`DummyCloud`]: in-memory provider with call recording.

pub mod dummy;
pub mod error;
pub mod provider;
pub mod router;

pub use dummy::{DummyCloud, Invocation};
pub use error::{CpiError, CpiResult};
pub use provider::{CloudProvider, CreateVmRequest, VmMetadata, tolerate_not_found};
pub use router::{CpiBuilder, CpiRegistry, CpiRouter, RoutedCpi};
