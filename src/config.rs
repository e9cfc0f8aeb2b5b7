//! Daemon configuration and topology declaration.
//!
//! Layered the usual way: compiled defaults, then `seclab.toml`, then
//! `seclab.json`, then `SECLAB_`-prefixed environment variables. The
//! topology itself may live inline or in a separate file referenced by
//! `topology_file`.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;

use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::topology::Transport;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Working directory for node home dirs and relay sockets.
    pub work_dir: PathBuf,
    /// Kubernetes namespace for remote nodes; autodetected when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Transport used for any link that cannot be a direct virtual cable.
    pub default_transport: Transport,
    /// Seconds between orchestrator status polls.
    pub poll_interval_secs: u64,
    /// Overall deadline for a remote node to become Running; unbounded when
    /// absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realize_timeout_secs: Option<u64>,
    /// Poll attempts to wait for remote deletion at shutdown.
    pub delete_wait_retries: u32,
    pub socat_path: String,
    /// Load the topology from this file instead of the inline table.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topology_file: Option<PathBuf>,
    #[serde(default)]
    pub topology: TopologyDecl,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            work_dir: "/tmp/seclab".into(),
            namespace: None,
            default_transport: Transport::L2tp,
            poll_interval_secs: 3,
            realize_timeout_secs: None,
            delete_wait_retries: 60,
            socat_path: "socat".into(),
            topology_file: None,
            topology: TopologyDecl::default(),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let mut config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("seclab.toml"))
            .merge(Json::file("seclab.json"))
            .merge(Env::prefixed("SECLAB_"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // An external topology file replaces the inline declaration.
        if let Some(ref path) = config.topology_file {
            config.topology = Figment::from(Toml::file(path)).extract().map_err(|e| {
                anyhow::anyhow!("Failed to load topology {}: {}", path.display(), e)
            })?;
        }

        Ok(config)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TopologyDecl {
    #[serde(default)]
    pub nodes: Vec<NodeDecl>,
    #[serde(default)]
    pub links: Vec<LinkDecl>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKindDecl {
    #[default]
    Local,
    Remote,
}

fn default_image() -> String {
    "hackinsdn/debian:stable".to_string()
}

fn default_command() -> Vec<String> {
    vec![
        "/bin/bash".to_string(),
        "-c".to_string(),
        "tail -f /dev/null".to_string(),
    ]
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeDecl {
    pub name: String,
    #[serde(default)]
    pub kind: NodeKindDecl,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_command")]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVarDecl>,
    /// CIDRs this node owns; consumed verbatim by the routing engine.
    #[serde(default)]
    pub mynetworks: Vec<Ipv4Net>,
    /// Published ports, `[bind-host:]bind-port:dest-port[/proto]`.
    #[serde(default)]
    pub publish: Vec<String>,
    #[serde(default)]
    pub routes: Vec<RouteDecl>,
    #[serde(default)]
    pub services: Vec<ServiceDecl>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EnvVarDecl {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteDecl {
    pub dest: Ipv4Net,
    pub via: Ipv4Addr,
}

/// A post-start command run inside the node, logging to `<home>/<name>.log`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceDecl {
    pub name: String,
    pub command: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LinkDecl {
    pub a: String,
    pub b: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub a_if: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub b_if: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub a_addr: Option<Ipv4Net>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub b_addr: Option<Ipv4Net>,
    /// Forces a transport instead of the planner's choice.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<Transport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    Tcp,
    Udp,
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Tcp => write!(f, "tcp"),
            Proto::Udp => write!(f, "udp"),
        }
    }
}

/// A published port, parsed from `[bind-host:]bind-port:dest-port[/proto]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishSpec {
    pub bind_host: String,
    pub bind_port: u16,
    pub dest_port: u16,
    pub proto: Proto,
}

impl FromStr for PublishSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::BadPublishSpec(s.to_string());
        let (ports, proto) = match s.rsplit_once('/') {
            Some((p, "tcp")) => (p, Proto::Tcp),
            Some((p, "udp")) => (p, Proto::Udp),
            Some(_) => return Err(bad()),
            None => (s, Proto::Tcp),
        };
        let parts: Vec<&str> = ports.split(':').collect();
        let (bind_host, bind_port, dest_port) = match parts.as_slice() {
            [bind, dest] => ("0.0.0.0", bind, dest),
            [host, bind, dest] if !host.is_empty() => (*host, bind, dest),
            _ => return Err(bad()),
        };
        Ok(PublishSpec {
            bind_host: bind_host.to_string(),
            bind_port: bind_port.parse().map_err(|_| bad())?,
            dest_port: dest_port.parse().map_err(|_| bad())?,
            proto,
        })
    }
}
