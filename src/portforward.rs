//! Port-forward supervision: socat relays publishing a node's service to
//! the outside, tracked so every spawned process can be terminated.
//!
//! A proxy handle is a relation, not an owning reference: entries map to
//! pids, explicit termination is the only destructor path, and an entry
//! whose owning node has already disappeared is a leak to be reported, not
//! silently dropped.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use log::{debug, error, info};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

use crate::config::PublishSpec;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::topology::{Node, NodeHandle};

/// A proxy that cannot bind (address in use, bad address) dies within this
/// window; surviving it is taken as a successful start. Near-zero so the
/// control thread never stalls on a healthy proxy.
const START_GRACE: Duration = Duration::from_millis(50);

/// How long to wait for SIGTERM to take before escalating to SIGKILL.
const REAP_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHandle(u64);

struct ProxyProc {
    pid: u32,
    child: Child,
    desc: String,
}

struct ForwardEntry {
    id: u64,
    node: String,
    desc: String,
    /// One relay, or two when chained through a unix socket.
    procs: Vec<ProxyProc>,
}

pub struct Forwarder {
    socat: String,
    run_dir: PathBuf,
    next_id: u64,
    entries: Vec<ForwardEntry>,
}

impl Forwarder {
    pub fn new(socat: impl Into<String>, run_dir: impl Into<PathBuf>) -> Self {
        Self {
            socat: socat.into(),
            run_dir: run_dir.into(),
            next_id: 1,
            entries: Vec::new(),
        }
    }

    /// Expose a node's port per its publish spec.
    ///
    /// For a remote node the relay runs in the management context and
    /// targets the pod IP directly. A local node's service is only
    /// reachable from inside its namespace, so the relay is chained: a
    /// namespace-local socat bridges a unix socket to the internal port,
    /// and a management-side socat bridges the public bind to that socket.
    pub async fn publish(
        &mut self,
        engine: &dyn Engine,
        node: &Node,
        spec: &PublishSpec,
    ) -> Result<ProxyHandle> {
        let label = format!(
            "-lpseclab-socat-{}-{}-{}-{}",
            spec.proto, spec.bind_port, node.name, spec.dest_port
        );
        let listen = format!(
            "{}-listen:{},bind={},reuseaddr,fork",
            spec.proto, spec.bind_port, spec.bind_host
        );

        let mut procs = Vec::new();
        match &node.handle {
            Some(NodeHandle::Remote {
                pod_ip: Some(ip), ..
            }) => {
                let target = format!("{}:{}:{}", spec.proto, ip, spec.dest_port);
                let child = self.spawn_mgmt(&[label.clone(), listen, target])?;
                procs.push(ensure_started(child, label, spec).await?);
            }
            Some(NodeHandle::Local(h)) => {
                std::fs::create_dir_all(&self.run_dir)?;
                let sock = self
                    .run_dir
                    .join(format!("{}-{}.sock", node.name, spec.bind_port));
                // A stale socket from a previous run blocks the listener.
                let _ = std::fs::remove_file(&sock);

                let ns_label = format!("{label}-ns");
                let ns_argv = vec![
                    self.socat.clone(),
                    ns_label.clone(),
                    format!("unix-listen:{},fork", sock.display()),
                    format!("{}:127.0.0.1:{}", spec.proto, spec.dest_port),
                ];
                let ns_child = engine.spawn_in_node(*h, &ns_argv)?;
                let ns_proc = ensure_started(ns_child, ns_label, spec).await?;

                let mgmt = self.spawn_mgmt(&[
                    label.clone(),
                    listen,
                    format!("unix-connect:{}", sock.display()),
                ]);
                let mgmt_proc = match mgmt {
                    Ok(child) => ensure_started(child, label, spec).await,
                    Err(e) => Err(e),
                };
                match mgmt_proc {
                    Ok(p) => {
                        procs.push(ns_proc);
                        procs.push(p);
                    }
                    Err(e) => {
                        // Don't leave the namespace half of the chain behind.
                        terminate_proc(ns_proc).await;
                        return Err(e);
                    }
                }
            }
            _ => return Err(Error::NodeNotReady(node.name.clone())),
        }

        let id = self.next_id;
        self.next_id += 1;
        let desc = format!(
            "{}:{} -> {}:{} ({})",
            spec.bind_host, spec.bind_port, node.name, spec.dest_port, spec.proto
        );
        info!("published {desc}");
        self.entries.push(ForwardEntry {
            id,
            node: node.name.clone(),
            desc,
            procs,
        });
        Ok(ProxyHandle(id))
    }

    /// Terminate one forward. A handle whose entry is already gone is not an
    /// error, and other entries are untouched.
    pub async fn unpublish(&mut self, handle: ProxyHandle) -> Result<()> {
        let Some(pos) = self.entries.iter().position(|e| e.id == handle.0) else {
            return Ok(());
        };
        let entry = self.entries.remove(pos);
        debug!("unpublishing {}", entry.desc);
        for proc in entry.procs {
            terminate_proc(proc).await;
        }
        Ok(())
    }

    /// Terminate every forward owned by a node; called before the node's
    /// resources are reclaimed so signal delivery stays reliable.
    pub async fn unpublish_node(&mut self, node: &str) {
        for handle in self.handles_for(node) {
            let _ = self.unpublish(handle).await;
        }
    }

    pub fn handles_for(&self, node: &str) -> Vec<ProxyHandle> {
        self.entries
            .iter()
            .filter(|e| e.node == node)
            .map(|e| ProxyHandle(e.id))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Final sweep at teardown. Any entry still tracked for a node that no
    /// longer exists is an orphaned OS process; report it loudly and
    /// terminate it anyway.
    pub async fn shutdown(&mut self, live_nodes: &HashSet<String>) {
        for entry in std::mem::take(&mut self.entries) {
            if !live_nodes.contains(&entry.node) {
                error!(
                    "leaked port-forward {}: owning node {} is gone but pids {:?} were still tracked",
                    entry.desc,
                    entry.node,
                    entry.procs.iter().map(|p| p.pid).collect::<Vec<_>>()
                );
            }
            for proc in entry.procs {
                terminate_proc(proc).await;
            }
        }
    }

    fn spawn_mgmt(&self, args: &[String]) -> Result<Child> {
        Command::new(&self.socat)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                crate::error::CommandError::Spawn {
                    cmd: format!("{} {}", self.socat, args.join(" ")),
                    source: e,
                }
                .into()
            })
    }
}

/// Zero-ish-timeout liveness check right after spawn: catches bind failures
/// without sleeping on the control thread for healthy proxies.
async fn ensure_started(mut child: Child, desc: String, spec: &PublishSpec) -> Result<ProxyProc> {
    match tokio::time::timeout(START_GRACE, child.wait()).await {
        Err(_) => {
            // Still running after the grace window.
            let pid = child.id().ok_or_else(|| Error::ProxyStartError {
                bind_host: spec.bind_host.clone(),
                bind_port: spec.bind_port,
                stderr: "proxy pid unavailable".into(),
            })?;
            Ok(ProxyProc { pid, child, desc })
        }
        Ok(status) => {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr).await;
            }
            let code = status.ok().and_then(|s| s.code());
            Err(Error::ProxyStartError {
                bind_host: spec.bind_host.clone(),
                bind_port: spec.bind_port,
                stderr: format!("rc={code:?} {}", stderr.trim()),
            })
        }
    }
}

async fn terminate_proc(mut proc: ProxyProc) {
    // ESRCH just means the proxy is already gone.
    let _ = signal::kill(Pid::from_raw(proc.pid as i32), Signal::SIGTERM);
    if tokio::time::timeout(REAP_WAIT, proc.child.wait()).await.is_err() {
        let _ = proc.child.start_kill();
        let _ = proc.child.wait().await;
    }
}
