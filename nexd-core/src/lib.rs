//! Device/peer reconciliation engine: key store, endpoint discovery, controller client, device
//! cache, and the reconciler that drives the tunnel data plane from controller state.
//!
//! The agent is not an authoritative store: controller state wins on every reconciliation pass
//! (spec §1, Non-goals). This crate owns everything upstream of the data plane; `nexd-dataplane`
//! owns the peer programming itself.

pub mod controller;
pub mod device_cache;
pub mod endpoint;
pub mod error;
pub mod keystore;
pub mod model;
pub mod reconciler;

pub use controller::ControllerClient;
pub use device_cache::DeviceCache;
pub use error::{ConfigError, ControllerError};
pub use reconciler::{Reconciler, ReconcilerState};
