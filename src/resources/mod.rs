//! Resource admission control and monitoring.
//!
//! The [`ResourceManager`] owns all limit state for CPU, memory, disk and
//! network units. Requests are granted while capacity allows and otherwise
//! wait in a FIFO queue; a background monitor samples system usage, raises
//! alerts and reclaims capacity under pressure.

pub mod manager;
pub mod monitor;
pub mod types;

pub use manager::ResourceManager;
pub use monitor::{FixedUsageSampler, SystemUsageSampler, UsageSampler};
pub use types::*;
