pub mod config;
pub mod invariant;
pub mod model;
pub mod redact;
pub mod safe_display;
pub mod state;
pub mod tracing_config;

pub use safe_display::SafeDisplay;
