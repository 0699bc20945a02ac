// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

/// Top-level TOML configuration table recognised at the process root.
///
/// See the "Config surface" table of the design for the recognised keys.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Logical frame tick, in milliseconds. Defaults to 500ms.
    #[serde(default = "default_frame_interval")]
    pub frame_interval: u64,

    /// Worker-pool size. `0` means `hw - 1`.
    #[serde(default)]
    pub thread_pool_num: usize,

    /// Search patterns (with a `?` placeholder) for dynamic service
    /// modules. Carried for config-surface compatibility; this crate
    /// resolves services through a static [`crate::app::host::ServiceFactory`]
    /// registry rather than loading shared libraries (see DESIGN.md).
    #[serde(default)]
    pub service_path: Vec<String>,

    /// Services hosted by this process.
    #[serde(default)]
    pub services: Vec<ServiceConfig>,

    /// Path to a logging config file. Optional; falls back to the
    /// environment filter when absent.
    #[serde(default)]
    pub log_config: Option<String>,
}

/// One entry of the `services` array.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServiceConfig {
    /// Cluster-wide unique 16-bit service ID.
    pub id: u16,
    /// Service-type tag (partitions services into pools).
    #[serde(rename = "type")]
    pub service_type: u16,
    /// Name of the service module to start (matched against a
    /// [`crate::app::host::ServiceFactory`] registration).
    pub name: String,
    /// Start order relative to other services in this process (lower
    /// first). Defaults to 0.
    #[serde(default)]
    pub order: i32,
    /// Optional per-service tick override, in milliseconds.
    #[serde(default)]
    pub interval: Option<u64>,
    /// Service-specific arguments, kept as a raw TOML table until the
    /// owning service parses the keys it understands.
    #[serde(default)]
    pub args: toml::Value,
}

fn default_frame_interval() -> u64 {
    500
}

impl Config {
    /// Loads the configuration from a TOML file, validates it, and returns
    /// the ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config = toml::from_str(&s).context("failed to parse config TOML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        if self.frame_interval == 0 {
            self.frame_interval = default_frame_interval();
        }

        if self.thread_pool_num == 0 {
            let hw = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            self.thread_pool_num = hw.saturating_sub(1).max(1);
        }

        let mut seen = std::collections::HashSet::new();
        for svc in &self.services {
            ensure!(!svc.name.is_empty(), "service entry must have a name");
            ensure!(
                seen.insert(svc.id),
                "duplicate service id {} in config",
                svc.id
            );
        }

        Ok(())
    }

    /// Services sorted by `order`, stable for equal orders (config file
    /// order is the tiebreak).
    pub fn services_in_start_order(&self) -> Vec<&ServiceConfig> {
        let mut v: Vec<&ServiceConfig> = self.services.iter().collect();
        v.sort_by_key(|s| s.order);
        v
    }
}

/// Arguments recognised for a `gate` service (`args` table).
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct GateArgs {
    /// Address of the cluster's gate master.
    pub master_address: String,
    /// TCP port this gate listens on for local (same-host) services.
    pub local_port: u16,
    /// TCP port this gate listens on for peer gates.
    pub remote_port: u16,
    /// `host,port` strings of peer gates to dial, in addition to whatever
    /// the master's topology broadcasts announce.
    #[serde(default)]
    pub remote_hosts: Vec<String>,
}

/// Arguments recognised for any service that attaches via
/// [`crate::gate::connector::GateConnector`] (`args` table).
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ConnectorArgs {
    /// The local gate's `local_port`.
    pub port: u16,
    /// Requested shared-memory channel capacity, in bytes.
    pub channel_size: u32,
}

/// Arguments recognised for a `gate-master` service (`args` table).
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct GateMasterArgs {
    /// Address the master's single TCP listener binds.
    pub listen_address: String,
}

impl ServiceConfig {
    /// Parses `args` as [`GateArgs`].
    pub fn gate_args(&self) -> Result<GateArgs> {
        self.args
            .clone()
            .try_into()
            .context("service args are not a valid gate config")
    }

    /// Parses `args` as [`ConnectorArgs`].
    pub fn connector_args(&self) -> Result<ConnectorArgs> {
        self.args
            .clone()
            .try_into()
            .context("service args are not a valid gate-connector config")
    }

    /// Parses `args` as [`GateMasterArgs`].
    pub fn gate_master_args(&self) -> Result<GateMasterArgs> {
        self.args
            .clone()
            .try_into()
            .context("service args are not a valid gate-master config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let toml_src = r#"
            frame_interval = 250

            [[services]]
            id = 10
            type = 1
            name = "room"

            [services.args]
            port = 9000
            channel_size = 65536
        "#;
        let mut cfg: Config = toml::from_str(toml_src).expect("parse");
        cfg.validate_and_normalize().expect("validate");
        assert_eq!(cfg.frame_interval, 250);
        assert_eq!(cfg.services.len(), 1);
        let args = cfg.services[0].connector_args().expect("connector args");
        assert_eq!(args.port, 9000);
        assert_eq!(args.channel_size, 65536);
    }

    #[test]
    fn rejects_duplicate_ids() {
        let toml_src = r#"
            [[services]]
            id = 1
            type = 1
            name = "a"
            [[services]]
            id = 1
            type = 2
            name = "b"
        "#;
        let mut cfg: Config = toml::from_str(toml_src).expect("parse");
        assert!(cfg.validate_and_normalize().is_err());
    }

    #[test]
    fn zero_thread_pool_resolves_to_hardware() {
        let mut cfg = Config {
            frame_interval: 0,
            thread_pool_num: 0,
            service_path: vec![],
            services: vec![],
            log_config: None,
        };
        cfg.validate_and_normalize().expect("validate");
        assert!(cfg.thread_pool_num >= 1);
        assert_eq!(cfg.frame_interval, 500);
    }
}
