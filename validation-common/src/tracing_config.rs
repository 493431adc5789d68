use crate::safe_display::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// Mirrors the teacher's `golem_common::tracing::TracingConfig`: picks a
/// format (pretty for local dev, JSON for anything that looks deployed)
/// and installs a global `tracing_subscriber` once at process start.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TracingConfig {
    pub service_name: String,
    pub json: bool,
    pub env_filter: String,
}

impl TracingConfig {
    pub fn local_dev(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            json: false,
            env_filter: "info".to_string(),
        }
    }

    pub fn init(&self) {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(self.env_filter.clone()));

        let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

        if self.json {
            let _ = subscriber.json().try_init();
        } else {
            let _ = subscriber.try_init();
        }
    }
}

impl SafeDisplay for TracingConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "service: {}", self.service_name);
        let _ = writeln!(&mut result, "json: {}", self.json);
        let _ = writeln!(&mut result, "filter: {}", self.env_filter);
        result
    }
}
