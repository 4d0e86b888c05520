#![forbid(unsafe_code)]

//! Driver configuration: PLCs, their tags and scan periods.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::encap;
use crate::error::{EipError, Result};
use crate::tag::TagPath;

/// Top-level driver configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct DriverConfig {
    /// Scan period in seconds for tags that do not request one
    /// Default: 1.0
    #[serde(default = "default_period_s")]
    pub default_period_s: f64,
    /// Bound on every socket operation, in milliseconds
    /// Default: 5000
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Upper bound on a bundled request or response, in bytes. Requests are
    /// split into several transfers once a bundle would grow past this.
    /// Default: 500
    #[serde(default = "default_buffer_limit")]
    pub transfer_buffer_limit: usize,
    /// PLCs to scan
    #[serde(default)]
    pub plcs: Vec<PlcConfig>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            default_period_s: default_period_s(),
            timeout_ms: default_timeout_ms(),
            transfer_buffer_limit: default_buffer_limit(),
            plcs: Vec::new(),
        }
    }
}

impl DriverConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn default_period(&self) -> Duration {
        Duration::from_secs_f64(self.default_period_s)
    }
}

/// One controller.
#[derive(Debug, Deserialize, Clone)]
pub struct PlcConfig {
    /// Logical name, unique within the file
    pub name: String,
    /// Hostname or IP address
    pub host: String,
    /// TCP port
    /// Default: 44818
    #[serde(default = "default_port")]
    pub port: u16,
    /// Backplane slot of the controller CPU
    /// Default: 0
    #[serde(default)]
    pub slot: u8,
    /// Tags to scan on this PLC
    #[serde(default)]
    pub tags: Vec<TagConfig>,
}

/// One subscribed tag.
#[derive(Debug, Deserialize, Clone)]
pub struct TagConfig {
    /// Tag string, e.g. "MyUDT.Field[3]"
    pub tag: String,
    /// Scan period in seconds; the driver default applies when omitted
    pub period_s: Option<f64>,
    /// Number of array elements to transfer
    /// Default: 1
    #[serde(default = "default_elements")]
    pub elements: u16,
}

pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<DriverConfig> {
    let txt = fs::read_to_string(p)
        .map_err(|e| EipError::Config(format!("failed to read config file: {e}")))?;
    let cfg: DriverConfig = toml::from_str(&txt)
        .map_err(|e| EipError::Config(format!("failed to parse config: {e}")))?;

    validate_config(&cfg)?;

    Ok(cfg)
}

fn validate_config(cfg: &DriverConfig) -> Result<()> {
    if cfg.default_period_s <= 0.0 {
        return Err(EipError::Config("default_period_s must be positive".into()));
    }
    if cfg.timeout_ms == 0 {
        return Err(EipError::Config("timeout_ms must be positive".into()));
    }

    let mut names = std::collections::HashSet::new();
    for plc in &cfg.plcs {
        if plc.name.is_empty() {
            return Err(EipError::Config("PLC name must not be empty".into()));
        }
        if !names.insert(plc.name.as_str()) {
            return Err(EipError::Config(format!(
                "duplicate PLC name: {}",
                plc.name
            )));
        }
        if plc.host.is_empty() {
            return Err(EipError::Config(format!(
                "PLC {} has an empty host",
                plc.name
            )));
        }
        for tag in &plc.tags {
            tag.tag.parse::<TagPath>().map_err(|e| {
                EipError::Config(format!("PLC {}: {e}", plc.name))
            })?;
            if let Some(period) = tag.period_s {
                if period <= 0.0 {
                    return Err(EipError::Config(format!(
                        "PLC {}: tag {} has a non-positive period",
                        plc.name, tag.tag
                    )));
                }
            }
            if tag.elements == 0 {
                return Err(EipError::Config(format!(
                    "PLC {}: tag {} requests zero elements",
                    plc.name, tag.tag
                )));
            }
        }
    }

    Ok(())
}

fn default_period_s() -> f64 {
    1.0
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_buffer_limit() -> usize {
    500
}

fn default_port() -> u16 {
    encap::DEFAULT_PORT
}

fn default_elements() -> u16 {
    1
}
