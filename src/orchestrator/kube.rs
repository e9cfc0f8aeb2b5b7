//! Kubernetes-backed orchestrator.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EnvVar, Pod, PodSpec, SecurityContext,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, PostParams};
use kube::Client;
use log::debug;
use tokio::io::AsyncReadExt;

use super::{Orchestrator, PodRequest, PodStatus};
use crate::error::OrchestratorError;
use crate::exec::CmdOutput;

pub struct KubeOrchestrator {
    client: Client,
    namespace: String,
}

impl KubeOrchestrator {
    /// Auto-discovers cluster configuration (in-cluster service account,
    /// then KUBECONFIG, then ~/.kube/config).
    pub async fn new(namespace: Option<String>) -> Result<Self, OrchestratorError> {
        let client = Client::try_default().await?;
        let namespace = namespace.unwrap_or_else(Self::default_namespace);
        debug!("kubernetes client initialized, namespace {namespace}");
        Ok(Self { client, namespace })
    }

    /// Namespace resolution order: NAMESPACE env var, the mounted service
    /// account namespace, then "default".
    fn default_namespace() -> String {
        if let Ok(ns) = std::env::var("NAMESPACE") {
            if !ns.is_empty() {
                return ns;
            }
        }
        std::fs::read_to_string("/var/run/secrets/kubernetes.io/serviceaccount/namespace")
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "default".to_string())
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Pods get NET_ADMIN (tunnel interfaces are created inside them) and an
    /// unconfined apparmor profile, and carry the cleanup label.
    fn manifest(req: &PodRequest) -> Pod {
        let labels: BTreeMap<String, String> =
            [("app".to_string(), "seclab".to_string())].into();
        let annotations: BTreeMap<String, String> = [(
            format!(
                "container.apparmor.security.beta.kubernetes.io/{}",
                req.name
            ),
            "unconfined".to_string(),
        )]
        .into();
        let env: Vec<EnvVar> = req
            .env
            .iter()
            .map(|(name, value)| EnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                ..Default::default()
            })
            .collect();
        Pod {
            metadata: ObjectMeta {
                name: Some(req.name.clone()),
                labels: Some(labels),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: req.name.clone(),
                    image: Some(req.image.clone()),
                    image_pull_policy: Some("Always".to_string()),
                    command: Some(req.command.clone()),
                    env: Some(env),
                    security_context: Some(SecurityContext {
                        capabilities: Some(Capabilities {
                            add: Some(vec!["NET_ADMIN".to_string()]),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn create_pod(&self, req: &PodRequest) -> Result<(), OrchestratorError> {
        self.pods()
            .create(&PostParams::default(), &Self::manifest(req))
            .await?;
        Ok(())
    }

    async fn pod_status(&self, name: &str) -> Result<PodStatus, OrchestratorError> {
        let pod = match self.pods().get(name).await {
            Ok(pod) => pod,
            Err(kube::Error::Api(err)) if err.code == 404 => {
                return Err(OrchestratorError::PodNotFound { name: name.into() })
            }
            Err(e) => return Err(e.into()),
        };
        let status = pod.status.unwrap_or_default();
        Ok(PodStatus {
            phase: status.phase.unwrap_or_default(),
            ip: status.pod_ip.and_then(|ip| ip.parse().ok()),
        })
    }

    async fn delete_pod(&self, name: &str) -> Result<(), OrchestratorError> {
        match self.pods().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exec(&self, name: &str, cmd: &str) -> Result<CmdOutput, OrchestratorError> {
        let mut attached = self
            .pods()
            .exec(name, vec!["sh", "-c", cmd], &AttachParams::default())
            .await
            .map_err(|e| match e {
                kube::Error::Api(ref err) if err.code == 404 => {
                    OrchestratorError::PodNotFound { name: name.into() }
                }
                _ => OrchestratorError::Exec {
                    name: name.into(),
                    message: e.to_string(),
                },
            })?;

        let mut stdout_pipe = attached.stdout().ok_or_else(|| OrchestratorError::Exec {
            name: name.into(),
            message: "stdout not attached".into(),
        })?;
        let mut stderr_pipe = attached.stderr().ok_or_else(|| OrchestratorError::Exec {
            name: name.into(),
            message: "stderr not attached".into(),
        })?;
        let status_fut = attached.take_status();

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let (out_res, err_res) = tokio::join!(
            stdout_pipe.read_to_end(&mut stdout),
            stderr_pipe.read_to_end(&mut stderr)
        );
        out_res.map_err(|e| OrchestratorError::Exec {
            name: name.into(),
            message: e.to_string(),
        })?;
        err_res.map_err(|e| OrchestratorError::Exec {
            name: name.into(),
            message: e.to_string(),
        })?;

        // The websocket carries exit status as a Status object, not a code;
        // dig the code out of the cause list when the command failed.
        let code = match status_fut {
            Some(fut) => match fut.await {
                Some(status) if status.status.as_deref() == Some("Success") => Some(0),
                Some(status) => status
                    .details
                    .and_then(|d| d.causes)
                    .unwrap_or_default()
                    .into_iter()
                    .find(|c| c.reason.as_deref() == Some("ExitCode"))
                    .and_then(|c| c.message.and_then(|m| m.trim().parse().ok()))
                    .or(Some(1)),
                None => Some(1),
            },
            None => Some(1),
        };
        let _ = attached.join().await;

        Ok(CmdOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            code,
        })
    }

    async fn list_pods(&self, selector: &str) -> Result<Vec<String>, OrchestratorError> {
        let lp = ListParams::default().labels(selector);
        let pods = self.pods().list(&lp).await?;
        Ok(pods
            .items
            .into_iter()
            .filter_map(|p| p.metadata.name)
            .collect())
    }
}
