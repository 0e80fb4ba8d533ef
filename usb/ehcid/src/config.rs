use std::time::Duration;

use lazy_static::lazy_static;
use serde::Deserialize;

/// A class driver entry of the `[[drivers]]` table.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct DriverConfig {
    pub name: String,
    pub class: u8,
    /// Negative values match every subclass.
    #[serde(default = "any_subclass")]
    pub subclass: i16,
}

fn any_subclass() -> i16 {
    -1
}

impl DriverConfig {
    pub fn matches(&self, class: u8, subclass: u8) -> bool {
        self.class == class && (self.subclass < 0 || self.subclass == i16::from(subclass))
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    pub sched_ack_retries: u32,
    pub sched_ack_delay_us: u64,
    pub uframe_budget: u16,
    pub qtd_max_len: usize,
    pub qh_count: usize,
    pub qtd_count: usize,
    pub itd_count: usize,
    pub sitd_count: usize,
    pub iso_ep_count: usize,
    pub iso_start_threshold: u16,
    pub enum_retries: u8,
    pub desc_retries: u8,
    pub debounce_ms: u64,
    pub reset_ms: u64,
    pub reset_recovery_ms: u64,
    pub set_address_recovery_ms: u64,
    pub ctrl_timeout_ms: u64,
    pub max_config_len: usize,
    pub max_hub_depth: u8,
    pub urb_pool_size: usize,
    pub poll_interval_ms: u64,
    pub drivers: Vec<DriverConfig>,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            sched_ack_retries: 100,
            sched_ack_delay_us: 1000,
            uframe_budget: 3072,
            qtd_max_len: 20480,
            qh_count: 64,
            qtd_count: 256,
            itd_count: 64,
            sitd_count: 64,
            iso_ep_count: 16,
            iso_start_threshold: 2,
            enum_retries: 3,
            desc_retries: 3,
            debounce_ms: 100,
            reset_ms: 50,
            reset_recovery_ms: 10,
            set_address_recovery_ms: 2,
            ctrl_timeout_ms: 5000,
            max_config_len: 1024,
            max_hub_depth: 5,
            urb_pool_size: 64,
            poll_interval_ms: 2,
            drivers: Vec::new(),
        }
    }
}

lazy_static! {
    /// Configuration shipped with the driver.
    pub static ref DEFAULT_CONFIG: StackConfig =
        StackConfig::from_toml_str(include_str!("../config.toml")).expect("Failed to parse internally embedded config file");
}

impl StackConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn driver_for(&self, class: u8, subclass: u8) -> Option<&DriverConfig> {
        self.drivers.iter().find(|d| d.matches(class, subclass))
    }

    pub fn sched_ack_delay(&self) -> Duration {
        Duration::from_micros(self.sched_ack_delay_us)
    }

    pub fn ctrl_timeout(&self) -> Duration {
        Duration::from_millis(self.ctrl_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Short delays everywhere; used by tests that drive a simulated bus.
    #[cfg(test)]
    pub fn fast() -> Self {
        Self {
            sched_ack_retries: 5,
            sched_ack_delay_us: 10,
            debounce_ms: 1,
            reset_ms: 1,
            reset_recovery_ms: 1,
            set_address_recovery_ms: 0,
            ctrl_timeout_ms: 500,
            ..DEFAULT_CONFIG.clone()
        }
    }
}
