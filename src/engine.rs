//! Seam to the namespace/bridge emulation engine. The daemon only ever asks
//! it to create process-backed nodes, run or spawn commands inside them, and
//! wire direct virtual cables; it never reimplements namespace plumbing.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::process::{Child, Command};

use crate::error::CommandError;
use crate::exec::{run_host, CmdOutput};

/// Handle to a local, process-backed node: the pid anchoring its netns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalHandle {
    pub pid: u32,
}

#[async_trait]
pub trait Engine: Send + Sync {
    /// Create a process-backed node with its own network namespace.
    async fn create_node(&self, name: &str) -> Result<LocalHandle, CommandError>;

    /// Tear the node's anchor process down and reap it.
    async fn destroy_node(&self, name: &str) -> Result<(), CommandError>;

    /// Run a command inside the node's namespace and wait for it.
    async fn run_in_node(&self, handle: LocalHandle, cmd: &str) -> Result<CmdOutput, CommandError>;

    /// Spawn a long-lived process inside the node's namespace. The caller
    /// owns the child; stderr is piped for start-failure diagnostics.
    fn spawn_in_node(&self, handle: LocalHandle, argv: &[String]) -> Result<Child, CommandError>;

    /// Run a command on the host (the local nodes' management context).
    async fn run_on_host(&self, cmd: &str) -> Result<CmdOutput, CommandError>;

    /// Create a direct virtual cable between two local nodes.
    async fn create_veth_pair(
        &self,
        a: LocalHandle,
        ifname_a: &str,
        b: LocalHandle,
        ifname_b: &str,
    ) -> Result<(), CommandError>;
}

/// Thin shell-out implementation over `unshare`/`nsenter`/`ip`.
pub struct NetnsEngine {
    /// Anchor children, keyed by node name. Held so the namespaces outlive
    /// their creation call and the pids stay valid until `destroy_node`.
    anchors: Mutex<HashMap<String, Child>>,
}

impl NetnsEngine {
    pub fn new() -> Self {
        Self {
            anchors: Mutex::new(HashMap::new()),
        }
    }

    /// The anchor process runs `unshare --net` which only detaches its netns
    /// after exec; poll until /proc shows the child in a namespace distinct
    /// from ours before handing the pid out.
    async fn wait_netns_detached(pid: u32) -> Result<(), CommandError> {
        let ours = tokio::fs::read_link("/proc/self/ns/net").await.ok();
        for _ in 0..50 {
            let theirs = tokio::fs::read_link(format!("/proc/{pid}/ns/net")).await.ok();
            if theirs.is_some() && theirs != ours {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Err(CommandError::Failed {
            cmd: format!("unshare --net (pid {pid})"),
            code: None,
            stderr: "namespace never detached from the host".into(),
        })
    }
}

impl Default for NetnsEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Engine for NetnsEngine {
    async fn create_node(&self, name: &str) -> Result<LocalHandle, CommandError> {
        let child = Command::new("unshare")
            .args(["--net", "--", "sleep", "infinity"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| CommandError::Spawn {
                cmd: "unshare --net".into(),
                source: e,
            })?;
        let pid = child.id().ok_or_else(|| CommandError::Failed {
            cmd: "unshare --net".into(),
            code: None,
            stderr: "anchor process exited before returning a pid".into(),
        })?;
        Self::wait_netns_detached(pid).await?;

        let handle = LocalHandle { pid };
        self.run_in_node(handle, "ip link set lo up").await?;
        debug!("node {name}: anchor pid {pid}");
        self.anchors
            .lock()
            .expect("anchor table poisoned")
            .insert(name.to_string(), child);
        Ok(handle)
    }

    async fn destroy_node(&self, name: &str) -> Result<(), CommandError> {
        let child = self
            .anchors
            .lock()
            .expect("anchor table poisoned")
            .remove(name);
        if let Some(mut child) = child {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        Ok(())
    }

    async fn run_in_node(&self, handle: LocalHandle, cmd: &str) -> Result<CmdOutput, CommandError> {
        let out = Command::new("nsenter")
            .args(["-t", &handle.pid.to_string(), "-n", "sh", "-c", cmd])
            .output()
            .await
            .map_err(|e| CommandError::Spawn {
                cmd: cmd.to_string(),
                source: e,
            })?;
        Ok(CmdOutput::from_output(&out))
    }

    fn spawn_in_node(&self, handle: LocalHandle, argv: &[String]) -> Result<Child, CommandError> {
        Command::new("nsenter")
            .args(["-t", &handle.pid.to_string(), "-n"])
            .args(argv)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CommandError::Spawn {
                cmd: argv.join(" "),
                source: e,
            })
    }

    async fn run_on_host(&self, cmd: &str) -> Result<CmdOutput, CommandError> {
        run_host(cmd).await
    }

    async fn create_veth_pair(
        &self,
        a: LocalHandle,
        ifname_a: &str,
        b: LocalHandle,
        ifname_b: &str,
    ) -> Result<(), CommandError> {
        let cmd = format!(
            "ip link add {ifname_a} netns {} type veth peer name {ifname_b} netns {}",
            a.pid, b.pid
        );
        run_host(&cmd).await?.into_result(&cmd)?;
        Ok(())
    }
}
