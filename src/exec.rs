//! Command execution and the exit contract shared by every external
//! invocation: a command failed iff it exited non-zero or wrote anything to
//! its error channel. Kernel error text is surfaced raw, never parsed.

use std::process::Output;

use tokio::process::Command;

use crate::engine::Engine;
use crate::error::{CommandError, Error, Result};
use crate::orchestrator::Orchestrator;
use crate::topology::{Node, NodeHandle};

/// Captured output of one external command.
#[derive(Debug, Clone, Default)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: Option<i32>,
}

impl CmdOutput {
    pub fn from_output(out: &Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            code: out.status.code(),
        }
    }

    pub fn ok(&self) -> bool {
        self.code == Some(0) && self.stderr.trim().is_empty()
    }

    /// Raw text of both channels, for diagnostics.
    pub fn text(&self) -> String {
        let mut s = self.stdout.trim_end().to_string();
        if !self.stderr.trim().is_empty() {
            if !s.is_empty() {
                s.push(' ');
            }
            s.push_str(self.stderr.trim());
        }
        s
    }

    /// Apply the exit contract, yielding stdout or the raw failure.
    pub fn into_result(self, cmd: &str) -> Result<String, CommandError> {
        if self.ok() {
            Ok(self.stdout)
        } else {
            Err(CommandError::Failed {
                cmd: cmd.to_string(),
                code: self.code,
                stderr: self.text(),
            })
        }
    }
}

/// Run a shell command on the host (the management context for local nodes).
pub async fn run_host(cmd: &str) -> Result<CmdOutput, CommandError> {
    let out = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .output()
        .await
        .map_err(|e| CommandError::Spawn {
            cmd: cmd.to_string(),
            source: e,
        })?;
    Ok(CmdOutput::from_output(&out))
}

/// Execution contexts for a topology: the emulation engine for local nodes
/// and (optionally) the pod orchestrator for remote ones.
#[derive(Clone, Copy)]
pub struct Ctx<'a> {
    pub engine: &'a dyn Engine,
    pub orch: Option<&'a dyn Orchestrator>,
}

impl<'a> Ctx<'a> {
    fn orch(&self) -> Result<&'a dyn Orchestrator> {
        self.orch.ok_or(Error::OrchestratorUnavailable)
    }

    /// Run inside the node's primary network namespace.
    pub async fn run_in(&self, node: &Node, cmd: &str) -> Result<CmdOutput> {
        match &node.handle {
            Some(NodeHandle::Local(h)) => Ok(self.engine.run_in_node(*h, cmd).await?),
            Some(NodeHandle::Remote { pod_name, .. }) => {
                Ok(self.orch()?.exec(pod_name, cmd).await?)
            }
            None => Err(Error::NodeNotReady(node.name.clone())),
        }
    }

    /// Run in the management context that owns the node's underlay: the host
    /// for a local node, the pod itself for a remote one (a pod's primary
    /// network identity is the management network, not the emulated one).
    pub async fn run_mgmt(&self, node: &Node, cmd: &str) -> Result<CmdOutput> {
        match &node.handle {
            Some(NodeHandle::Local(_)) => Ok(self.engine.run_on_host(cmd).await?),
            Some(NodeHandle::Remote { pod_name, .. }) => {
                Ok(self.orch()?.exec(pod_name, cmd).await?)
            }
            None => Err(Error::NodeNotReady(node.name.clone())),
        }
    }
}
