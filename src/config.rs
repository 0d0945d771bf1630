//! Configuration for the compute-node service.

use clap::Args;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

use crate::params::{Params, ParamsFileError};

/// A compute device label. One worker process is pinned to each device and
/// the pair `(node, device)` selects a disjoint slice of the nonce space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Cuda(u32),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(index) => write!(f, "cuda:{index}"),
        }
    }
}

/// The device string is not `cpu` or `cuda:<index>`.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown device {0:?}")]
pub struct UnknownDevice(pub String);

impl FromStr for Device {
    type Err = UnknownDevice;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "cpu" {
            return Ok(Device::Cpu);
        }
        if let Some(index) = s.strip_prefix("cuda:") {
            if let Ok(index) = index.parse() {
                return Ok(Device::Cuda(index));
            }
        }
        Err(UnknownDevice(s.to_string()))
    }
}

impl Serialize for Device {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Device {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// CLI/env arguments of the serving binary.
#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Bind address.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,
    /// Bind port.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,
    /// This node's index in the network-wide nonce partition.
    #[arg(long, env = "POW_NODE_ID", default_value_t = 0)]
    pub node_id: u32,
    /// Total number of nodes in the nonce partition.
    #[arg(long, env = "POW_NODE_COUNT", default_value_t = 1)]
    pub node_count: u32,
    /// Comma-separated device labels, one worker process per device.
    #[arg(long, env = "POW_DEVICES", default_value = "cpu", value_delimiter = ',')]
    pub devices: Vec<String>,
    /// JSON file with the default model hyperparameters.
    #[arg(
        long,
        env = "MODEL_PARAMS_PATH",
        default_value = "/app/resources/params.json"
    )]
    pub model_params_path: PathBuf,
}

/// Invalid service configuration; surfaces at startup or session init.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    UnknownDevice(#[from] UnknownDevice),
    #[error("at least one device is required")]
    NoDevices,
    #[error("node_id {node_id} is out of range for node_count {node_count}")]
    NodeOutOfRange { node_id: u32, node_count: u32 },
    #[error(transparent)]
    Params(#[from] ParamsFileError),
}

/// Resolved service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub node_id: u32,
    pub node_count: u32,
    pub devices: Vec<Device>,
    pub default_params: Params,
}

impl Config {
    /// Validates arguments and loads the default params file.
    ///
    /// A missing params file falls back to the built-in defaults so a bare
    /// deployment can start; a present-but-broken file is a hard error.
    pub fn load(args: &ServeArgs) -> Result<Self, ConfigError> {
        let devices = args
            .devices
            .iter()
            .map(|label| label.trim().parse())
            .collect::<Result<Vec<Device>, _>>()?;
        if devices.is_empty() {
            return Err(ConfigError::NoDevices);
        }
        if args.node_count == 0 || args.node_id >= args.node_count {
            return Err(ConfigError::NodeOutOfRange {
                node_id: args.node_id,
                node_count: args.node_count,
            });
        }
        let default_params = if args.model_params_path.exists() {
            Params::from_file(&args.model_params_path)?
        } else {
            tracing::warn!(
                path = %args.model_params_path.display(),
                "model params file not found, using built-in defaults"
            );
            Params::default()
        };
        Ok(Self {
            host: args.host,
            port: args.port,
            node_id: args.node_id,
            node_count: args.node_count,
            devices,
            default_params,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_labels_parse_and_print() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("cuda:3".parse::<Device>().unwrap(), Device::Cuda(3));
        assert_eq!(Device::Cuda(3).to_string(), "cuda:3");
        assert!("tpu".parse::<Device>().is_err());
        assert!("cuda:".parse::<Device>().is_err());
    }

    #[test]
    fn device_serde_uses_the_label() {
        let device: Device = serde_json::from_str("\"cuda:1\"").unwrap();
        assert_eq!(device, Device::Cuda(1));
        assert_eq!(serde_json::to_string(&device).unwrap(), "\"cuda:1\"");
    }
}
