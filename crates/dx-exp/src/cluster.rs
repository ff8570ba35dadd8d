//! Cluster inventory: the servers experiments may target.
//!
//! A [`ClusterConfig`] is built once at process start and handed by reference
//! to the registry and dispatcher. Experiments hold cloned [`ServerSpec`]s, not
//! live connections; connections are opened per instance by a transport.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use dx_core::errors::{DxError, ErrorInfo};
use serde::{Deserialize, Serialize};

use crate::serde::from_yaml_str;

/// How commands reach the servers of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// One `ssh` process per command.
    #[default]
    Ssh,
    /// Commands run through `sh -c` on this machine.
    Local,
}

/// Coordinates and metadata for one cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSpec {
    /// Short name used in reports and templates.
    pub name: String,
    /// Hostname or IP address used to reach the node.
    pub host: String,
    #[serde(default = "ServerSpec::default_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<String>,
    /// Free-form per-node values exposed to templates, e.g. `ib_ip`.
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

impl ServerSpec {
    const fn default_port() -> u16 {
        22
    }

    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port: Self::default_port(),
            user: None,
            ssh_key: None,
            meta: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// `user@host`, or just the host when no user is configured.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    /// SSH arguments up to and including the destination, without a command.
    pub fn ssh_base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            self.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
        ];
        if let Some(key) = &self.ssh_key {
            args.push("-i".to_string());
            args.push(key.clone());
        }
        args.push(self.destination());
        args
    }
}

/// The fixed set of nodes a run may use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ClusterConfig {
    #[serde(default)]
    pub transport: TransportKind,
    pub servers: Vec<ServerSpec>,
}

impl ClusterConfig {
    pub fn new(transport: TransportKind, servers: Vec<ServerSpec>) -> Result<Self, DxError> {
        let config = Self { transport, servers };
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a standalone cluster file.
    pub fn load(path: &Path) -> Result<Self, DxError> {
        let text = fs::read_to_string(path).map_err(|err| {
            DxError::Serde(
                ErrorInfo::new("cluster.read", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })?;
        let config: ClusterConfig = from_yaml_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DxError> {
        let mut seen = BTreeSet::new();
        for server in &self.servers {
            if server.name.trim().is_empty() || server.host.trim().is_empty() {
                return Err(DxError::Config(
                    ErrorInfo::new("cluster.incomplete_server", "server needs a name and a host")
                        .with_context("name", server.name.clone()),
                ));
            }
            if !seen.insert(server.name.as_str()) {
                return Err(DxError::Config(
                    ErrorInfo::new("cluster.duplicate_server", "server name declared twice")
                        .with_context("name", server.name.clone()),
                ));
            }
        }
        Ok(())
    }

    pub fn servers(&self) -> &[ServerSpec] {
        &self.servers
    }

    pub fn get(&self, name: &str) -> Option<&ServerSpec> {
        self.servers.iter().find(|server| server.name == name)
    }

    /// The first `count` servers in inventory order.
    pub fn first(&self, count: usize) -> Result<Vec<ServerSpec>, DxError> {
        if count > self.servers.len() {
            return Err(DxError::Config(
                ErrorInfo::new("cluster.not_enough_servers", "experiment wants more servers than configured")
                    .with_context("requested", count.to_string())
                    .with_context("available", self.servers.len().to_string()),
            ));
        }
        Ok(self.servers[..count].to_vec())
    }

    /// Servers by name, in the order requested.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<ServerSpec>, DxError> {
        names
            .iter()
            .map(|name| {
                self.get(name.as_ref()).cloned().ok_or_else(|| {
                    DxError::Config(
                        ErrorInfo::new("cluster.unknown_server", "no server with that name")
                            .with_context("name", name.as_ref()),
                    )
                })
            })
            .collect()
    }
}
