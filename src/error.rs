//! Error taxonomy for the lab daemon.

use std::time::Duration;

use thiserror::Error;

/// Failures from running an external command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn `{cmd}`: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },
    /// Non-zero exit or any output on stderr. The raw text is kept verbatim
    /// so kernel-level messages reach the operator unmangled.
    #[error("`{cmd}` failed (exit={code:?}): {stderr}")]
    Failed {
        cmd: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Failures from the pod orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("pod {name} not found")]
    PodNotFound { name: String },
    #[error("exec in pod {name} failed: {message}")]
    Exec { name: String, message: String },
    #[error(transparent)]
    Api(#[from] kube::Error),
}

#[derive(Debug, Error)]
pub enum Error {
    /// A remote node never reported Running within the caller's deadline.
    /// The node stays Pending; link and route setup must not touch it.
    #[error("node {node} did not become Running within {waited:?}")]
    SchedulingTimeout { node: String, waited: Duration },

    /// One or both sides of a two-sided tunnel sequence failed. Carries the
    /// raw output of both sides so the operator can correlate them.
    #[error("tunnel setup failed for link {link}: side_a=[{side_a}] side_b=[{side_b}]")]
    TunnelSetupFailed {
        link: String,
        side_a: String,
        side_b: String,
    },

    /// The relay process died within the start grace window.
    #[error("proxy for {bind_host}:{bind_port} exited at start: {stderr}")]
    ProxyStartError {
        bind_host: String,
        bind_port: u16,
        stderr: String,
    },

    #[error("unknown node {0}")]
    UnknownNode(String),

    #[error("node {0} is not ready")]
    NodeNotReady(String),

    #[error("topology declares remote nodes but no orchestrator is configured")]
    OrchestratorUnavailable,

    #[error("invalid publish spec `{0}` (expected [bind-host:]bind-port:dest-port[/proto])")]
    BadPublishSpec(String),

    #[error("invalid topology: {0}")]
    BadTopology(String),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
