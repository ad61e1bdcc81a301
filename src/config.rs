use std::{io, path::PathBuf};

use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use tokio::fs;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub supply: SupplyConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SupplyConfig {
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between stability checks.
    #[serde(default = "default_check_interval")]
    pub check_interval_s: u64,
    /// Minimum seconds between heartbeat entries.
    #[serde(default = "default_heartbeat_period")]
    pub heartbeat_period_s: u64,
    /// Measured-vs-target deviation that trips an alarm, in kV.
    #[serde(default = "default_max_deviation")]
    pub max_deviation_kv: f64,
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
}

impl Config {
    pub async fn load(path: &str) -> Result<Self> {
        let data = fs::read(path)
            .await
            .wrap_err_with(|| format!("Failed to read {path}"))?;

        serde_yaml::from_slice(&data).wrap_err_with(|| format!("Failed to parse {path}"))
    }

    /// Falls back to the built-in defaults when no config file exists.
    pub async fn load_or_default(path: &str) -> Result<Self> {
        match fs::read(path).await {
            Ok(data) => {
                serde_yaml::from_slice(&data).wrap_err_with(|| format!("Failed to parse {path}"))
            }

            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("No config at {path}, using defaults");
                Ok(Config::default())
            }

            Err(err) => Err(err).wrap_err_with(|| format!("Failed to read {path}")),
        }
    }
}

impl Default for SupplyConfig {
    fn default() -> Self {
        SupplyConfig {
            port: default_port(),
            baud: default_baud(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            check_interval_s: default_check_interval(),
            heartbeat_period_s: default_heartbeat_period(),
            max_deviation_kv: default_max_deviation(),
            log_path: default_log_path(),
        }
    }
}

fn default_port() -> String {
    "/dev/ttyUSB0".to_owned()
}

const fn default_baud() -> u32 {
    9600
}

const fn default_check_interval() -> u64 {
    60
}

const fn default_heartbeat_period() -> u64 {
    600
}

const fn default_max_deviation() -> f64 {
    0.2
}

fn default_log_path() -> PathBuf {
    PathBuf::from("hvCtrl.log")
}
