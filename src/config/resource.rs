use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use super::invalid;
use crate::CursorType;
use crate::Key;
use crate::Result;

/// Chain retention per resource.
///
/// ```toml
/// [resource]
/// default_ttl_secs = 10800
/// reap_interval_secs = 60
///
/// [resource.ttl_secs]
/// host = 21600
/// ```
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ResourceConfig {
    /// Retention of chain nodes and details (unit: seconds)
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,

    /// Overrides keyed by resource name (`host`, `biz_set_relation`, ...)
    #[serde(default)]
    pub ttl_secs: HashMap<String, u64>,

    /// How often expired chain nodes are purged (unit: seconds)
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_ttl_secs(),
            ttl_secs: HashMap::new(),
            reap_interval_secs: default_reap_interval_secs(),
        }
    }
}

impl ResourceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_ttl_secs == 0 {
            return Err(invalid("resource default_ttl_secs must be greater than 0".to_string()));
        }
        for (name, ttl) in &self.ttl_secs {
            if CursorType::from_name(name) == CursorType::Unknown {
                return Err(invalid(format!("resource ttl_secs: unknown resource {name}")));
            }
            if *ttl == 0 {
                return Err(invalid(format!("resource ttl_secs.{name} must be greater than 0")));
            }
        }
        if self.reap_interval_secs == 0 {
            return Err(invalid("resource reap_interval_secs must be greater than 0".to_string()));
        }
        Ok(())
    }

    pub fn ttl_of(
        &self,
        resource: CursorType,
    ) -> u64 {
        self.ttl_secs.get(resource.as_str()).copied().unwrap_or(self.default_ttl_secs)
    }

    pub fn key(
        &self,
        resource: CursorType,
    ) -> Key {
        Key::new(resource, self.ttl_of(resource))
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

fn default_ttl_secs() -> u64 {
    3 * 3600
}
fn default_reap_interval_secs() -> u64 {
    60
}
