use serde::Deserialize;
use serde::Serialize;

use super::invalid;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MonitoringConfig {
    #[serde(default)]
    pub prometheus_enabled: bool,

    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            prometheus_enabled: false,
            prometheus_port: default_prometheus_port(),
        }
    }
}

impl MonitoringConfig {
    pub fn validate(&self) -> Result<()> {
        if self.prometheus_enabled && self.prometheus_port == 0 {
            return Err(invalid("prometheus_port must be set when enabled".to_string()));
        }
        Ok(())
    }
}

fn default_prometheus_port() -> u16 {
    8080
}
