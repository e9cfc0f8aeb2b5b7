//! Seam to the pod orchestrator. Everything here is assumed slow and
//! poll-based; readiness and deletion are observed, never awaited in-band.

use std::net::Ipv4Addr;

use async_trait::async_trait;

use crate::error::OrchestratorError;
use crate::exec::CmdOutput;

pub mod kube;
pub use self::kube::KubeOrchestrator;

/// Label applied to every pod this daemon creates, used for orphan cleanup
/// and for the shutdown wait.
pub const POD_LABEL: &str = "app=seclab";

/// What a remote node asks the orchestrator to schedule.
#[derive(Debug, Clone)]
pub struct PodRequest {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Phase and address as last reported by the orchestrator. The address is
/// meaningless unless the phase is `Running`.
#[derive(Debug, Clone, Default)]
pub struct PodStatus {
    pub phase: String,
    pub ip: Option<Ipv4Addr>,
}

impl PodStatus {
    pub fn running_ip(&self) -> Option<Ipv4Addr> {
        if self.phase == "Running" {
            self.ip
        } else {
            None
        }
    }
}

#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Submit a pod creation request. Returns as soon as it is accepted.
    async fn create_pod(&self, req: &PodRequest) -> Result<(), OrchestratorError>;

    /// Report the pod's current phase and IP.
    async fn pod_status(&self, name: &str) -> Result<PodStatus, OrchestratorError>;

    /// Request deletion. Absence of the pod is not an error.
    async fn delete_pod(&self, name: &str) -> Result<(), OrchestratorError>;

    /// Run a command inside the pod and capture its output.
    async fn exec(&self, name: &str, cmd: &str) -> Result<CmdOutput, OrchestratorError>;

    /// Names of pods matching a label selector.
    async fn list_pods(&self, selector: &str) -> Result<Vec<String>, OrchestratorError>;
}
