//! Tool backend contract and the bundled backends.

pub mod mock;
pub mod simulated;
pub mod types;

pub use mock::{MockCall, MockToolExecutor};
pub use simulated::{SimulatedToolExecutor, SimulationConfig, simulated_output};
pub use types::*;

/// Tool names the bundled backends and plan templates know about
pub const DEFAULT_TOOLS: &[&str] = &[
    "web_search",
    "file_read",
    "file_write",
    "shell",
    "browser",
    "analysis",
    "report",
];
