//! Bring-up and teardown sequencing.
//!
//! One control-plane task walks nodes, links, forwards and routes in order;
//! failures are collected rather than fatal so one bad node does not stop
//! the rest of a large topology from being diagnosed. Teardown runs in
//! reverse declaration order and ends by waiting for the orchestrator to
//! confirm every remote node is gone.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::config::Config;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::exec::{run_host, Ctx};
use crate::link::LinkManager;
use crate::orchestrator::{Orchestrator, PodRequest, POD_LABEL};
use crate::portforward::Forwarder;
use crate::routing;
use crate::topology::{Node, NodeHandle, NodeKind, NodeState, Topology};

pub struct Lab {
    cfg: Config,
    pub topo: Topology,
    engine: Arc<dyn Engine>,
    orch: Option<Arc<dyn Orchestrator>>,
    links: LinkManager,
    forwarder: Forwarder,
    failures: Vec<(String, Error)>,
}

impl Lab {
    pub fn new(
        cfg: Config,
        engine: Arc<dyn Engine>,
        orch: Option<Arc<dyn Orchestrator>>,
    ) -> Result<Self> {
        let topo = Topology::build(&cfg.topology)?;
        let links = LinkManager::new(cfg.default_transport);
        let forwarder = Forwarder::new(cfg.socat_path.clone(), cfg.work_dir.join("run"));
        Ok(Self {
            cfg,
            topo,
            engine,
            orch,
            links,
            forwarder,
            failures: Vec::new(),
        })
    }

    /// Failures collected during the last `start`; the topology may be up in
    /// a degraded state when this is non-empty.
    pub fn failures(&self) -> &[(String, Error)] {
        &self.failures
    }

    /// Bring the whole topology up: nodes, homes and services, links,
    /// port-forwards, then routes.
    pub async fn start(&mut self) -> Result<()> {
        self.failures.clear();
        let engine = Arc::clone(&self.engine);
        let orch = self.orch.clone();
        let ctx = Ctx {
            engine: engine.as_ref(),
            orch: orch.as_deref(),
        };

        for i in 0..self.topo.nodes.len() {
            let name = self.topo.nodes[i].name.clone();
            if let Err(e) = self.realize_node(i).await {
                self.topo.nodes[i].state = NodeState::Failed;
                error!("node {name}: realize failed: {e}");
                self.failures.push((name, e));
            }
        }

        for i in 0..self.topo.nodes.len() {
            if !self.topo.nodes[i].is_ready() {
                continue;
            }
            let name = self.topo.nodes[i].name.clone();
            match self.setup_home(&name) {
                Ok(home) => {
                    if let Err(e) = self.start_services(ctx, i, &home).await {
                        warn!("node {name}: service startup failed: {e}");
                    }
                }
                Err(e) => warn!("node {name}: home dir setup failed: {e}"),
            }
        }

        for i in 0..self.topo.links.len() {
            let mut link = self.topo.links[i].clone();
            let what = link.describe();
            let (a, b) = match (self.topo.node(&link.a.node), self.topo.node(&link.b.node)) {
                (Some(a), Some(b)) => (a.clone(), b.clone()),
                _ => {
                    self.failures
                        .push((what.clone(), Error::UnknownNode(what)));
                    continue;
                }
            };
            match self.links.setup(ctx, &a, &b, &mut link).await {
                Ok(()) => {
                    info!("link {} up ({:?})", link.describe(), link.transport);
                    self.topo.links[i] = link;
                }
                Err(e) => {
                    error!("link {what}: {e}");
                    self.failures.push((what, e));
                }
            }
        }

        for i in 0..self.topo.nodes.len() {
            let node = self.topo.nodes[i].clone();
            if !node.is_ready() {
                continue;
            }
            for spec in &node.publish {
                if let Err(e) = self.forwarder.publish(engine.as_ref(), &node, spec).await {
                    error!("node {}: publish {}: {e}", node.name, spec.bind_port);
                    self.failures.push((node.name.clone(), e));
                }
            }
        }

        let route_failures = routing::compute_and_install(&self.topo, ctx).await?;
        self.failures.extend(route_failures);
        self.install_extra_routes(ctx).await;

        if self.failures.is_empty() {
            info!("topology up: {} nodes, {} links", self.topo.nodes.len(), self.topo.links.len());
        } else {
            warn!("topology up degraded: {} failures", self.failures.len());
        }
        Ok(())
    }

    /// Tear everything down in reverse declaration order, then wait for the
    /// orchestrator to confirm remote deletion.
    pub async fn stop(&mut self) {
        let engine = Arc::clone(&self.engine);
        let orch = self.orch.clone();
        let ctx = Ctx {
            engine: engine.as_ref(),
            orch: orch.as_deref(),
        };

        for i in (0..self.topo.links.len()).rev() {
            let link = self.topo.links[i].clone();
            let (a, b) = match (self.topo.node(&link.a.node), self.topo.node(&link.b.node)) {
                (Some(a), Some(b)) => (a.clone(), b.clone()),
                _ => continue,
            };
            if let Err(e) = self.links.teardown(ctx, &a, &b, &link).await {
                warn!("link {}: teardown: {e}", link.describe());
            }
        }

        let mut had_remote = false;
        for i in (0..self.topo.nodes.len()).rev() {
            let node = self.topo.nodes[i].clone();
            self.topo.nodes[i].state = NodeState::Terminating;
            // Forwards go first: signalling a pid after its node's resources
            // are reclaimed is unreliable.
            self.forwarder.unpublish_node(&node.name).await;
            self.stop_services(ctx, &node).await;
            match &node.handle {
                Some(NodeHandle::Local(_)) => {
                    if let Err(e) = engine.destroy_node(&node.name).await {
                        warn!("node {}: destroy failed: {e}", node.name);
                    }
                }
                Some(NodeHandle::Remote { pod_name, .. }) => {
                    had_remote = true;
                    if let Some(orch) = orch.as_deref() {
                        if let Err(e) = orch.delete_pod(pod_name).await {
                            warn!("node {}: pod delete failed: {e}", node.name);
                        }
                    }
                }
                None => {}
            }
            self.topo.nodes[i].state = NodeState::Gone;
        }

        // Anything the per-node sweep missed is an orphaned process.
        self.forwarder.shutdown(&HashSet::new()).await;
        // Belt-and-braces for relays left over from a crashed previous run.
        let _ = run_host("pkill -f 'socat -lpseclab-socat'").await;

        if let Some(orch) = orch.as_deref() {
            // Sweep labeled pods we do not track, e.g. left by a crashed
            // previous run.
            match orch.list_pods(POD_LABEL).await {
                Ok(orphans) => {
                    for pod in orphans {
                        had_remote = true;
                        warn!("deleting orphaned pod {pod}");
                        if let Err(e) = orch.delete_pod(&pod).await {
                            warn!("orphaned pod {pod}: delete failed: {e}");
                        }
                    }
                }
                Err(e) => warn!("orphan pod sweep failed: {e}"),
            }
            if had_remote {
                let interval = Duration::from_secs(self.cfg.poll_interval_secs);
                info!("waiting for remote nodes to disappear...");
                if !wait_deleted(orch, POD_LABEL, self.cfg.delete_wait_retries, interval).await {
                    warn!(
                        "remote nodes still present after {} polls",
                        self.cfg.delete_wait_retries
                    );
                }
            }
        }
    }

    async fn realize_node(&mut self, i: usize) -> Result<()> {
        let name = self.topo.nodes[i].name.clone();
        self.topo.nodes[i].state = NodeState::Realizing;
        match self.topo.nodes[i].kind.clone() {
            NodeKind::Local => {
                let handle = self.engine.create_node(&name).await?;
                let node = &mut self.topo.nodes[i];
                node.handle = Some(NodeHandle::Local(handle));
                node.state = NodeState::Ready;
            }
            NodeKind::Remote {
                image,
                command,
                env,
            } => {
                let orch = self.orch.clone().ok_or(Error::OrchestratorUnavailable)?;
                let pod_name = format!("seclab-{name}");
                orch.create_pod(&PodRequest {
                    name: pod_name.clone(),
                    image,
                    command,
                    env,
                })
                .await?;
                let interval = Duration::from_secs(self.cfg.poll_interval_secs);
                let deadline = self.cfg.realize_timeout_secs.map(Duration::from_secs);
                let ip = wait_running(orch.as_ref(), &name, &pod_name, interval, deadline).await?;
                let node = &mut self.topo.nodes[i];
                node.handle = Some(NodeHandle::Remote {
                    pod_name,
                    pod_ip: Some(ip),
                });
                node.state = NodeState::Ready;
                info!("node {name}: pod running at {ip}");
            }
        }
        Ok(())
    }

    fn setup_home(&self, name: &str) -> std::io::Result<PathBuf> {
        let home = self.cfg.work_dir.join(name);
        std::fs::create_dir_all(&home)?;
        if let Ok(resolv) = std::fs::read_to_string("/etc/resolv.conf") {
            if resolv
                .lines()
                .any(|l| l.trim_start().starts_with("nameserver 127."))
            {
                warn!(
                    "loopback nameserver in /etc/resolv.conf; resolution inside {name} may fail"
                );
            }
            std::fs::write(home.join("resolv.conf"), resolv)?;
        }
        Ok(home)
    }

    /// Post-start services run inside the node with their output in the
    /// node's home dir. Local nodes only; a pod's services belong in its
    /// image command.
    async fn start_services(&mut self, ctx: Ctx<'_>, i: usize, home: &PathBuf) -> Result<()> {
        let node = self.topo.nodes[i].clone();
        if !node.is_local() {
            return Ok(());
        }
        for svc in &node.services {
            let cmd = format!(
                "{} >{}/{}.log 2>&1 & echo $!",
                svc.command,
                home.display(),
                svc.name
            );
            let out = ctx.run_in(&node, &cmd).await?;
            match out.stdout.split_whitespace().last().and_then(|s| s.parse::<u32>().ok()) {
                Some(pid) => {
                    debug!("node {}: service {} pid {pid}", node.name, svc.name);
                    self.topo.nodes[i].service_pids.push((svc.name.clone(), pid));
                }
                None => warn!(
                    "node {}: could not start service {}: {}",
                    node.name,
                    svc.name,
                    out.text()
                ),
            }
        }
        Ok(())
    }

    async fn stop_services(&self, ctx: Ctx<'_>, node: &Node) {
        for (svc, pid) in &node.service_pids {
            debug!("node {}: stopping service {svc} (pid {pid})", node.name);
            let _ = ctx.run_in(node, &format!("kill {pid}")).await;
        }
    }

    async fn install_extra_routes(&self, ctx: Ctx<'_>) {
        for node in &self.topo.nodes {
            if !node.is_ready() {
                continue;
            }
            for (dest, via) in &node.extra_routes {
                let cmd = format!("ip route add {dest} via {via}");
                match ctx.run_in(node, &cmd).await {
                    Ok(out) if out.ok() => {}
                    Ok(out) => warn!("node {}: {cmd}: {}", node.name, out.text()),
                    Err(e) => warn!("node {}: {cmd}: {e}", node.name),
                }
            }
        }
    }
}

/// Poll the orchestrator until the pod is Running with an address, bounded
/// by the caller's deadline. This is the only unbounded-wait point in the
/// control plane.
pub(crate) async fn wait_running(
    orch: &dyn Orchestrator,
    node: &str,
    pod: &str,
    interval: Duration,
    deadline: Option<Duration>,
) -> Result<Ipv4Addr> {
    let mut waited = Duration::ZERO;
    loop {
        match orch.pod_status(pod).await {
            Ok(status) => {
                if let Some(ip) = status.running_ip() {
                    return Ok(ip);
                }
                debug!("node {node}: pod {pod} phase {:?}", status.phase);
            }
            Err(e) => debug!("node {node}: status poll failed: {e}"),
        }
        if let Some(limit) = deadline {
            if waited >= limit {
                return Err(Error::SchedulingTimeout {
                    node: node.to_string(),
                    waited,
                });
            }
        }
        tokio::time::sleep(interval).await;
        waited += interval;
    }
}

/// Poll until no pods match the selector, so remote resources never outlive
/// the local process unnoticed.
pub(crate) async fn wait_deleted(
    orch: &dyn Orchestrator,
    selector: &str,
    retries: u32,
    interval: Duration,
) -> bool {
    for _ in 0..retries {
        match orch.list_pods(selector).await {
            Ok(pods) if pods.is_empty() => return true,
            Ok(pods) => debug!("{} pods still present", pods.len()),
            Err(e) => debug!("pod listing failed: {e}"),
        }
        tokio::time::sleep(interval).await;
    }
    false
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::config::{LinkDecl, NodeDecl, NodeKindDecl, TopologyDecl};
    use crate::engine::LocalHandle;
    use crate::error::{CommandError, OrchestratorError};
    use crate::exec::CmdOutput;
    use crate::orchestrator::PodStatus;

    /// Records every command instead of touching namespaces.
    struct FakeEngine {
        cmds: Mutex<Vec<String>>,
        next_pid: Mutex<u32>,
        fail_routes: bool,
    }

    impl FakeEngine {
        fn new() -> Self {
            Self {
                cmds: Mutex::new(Vec::new()),
                next_pid: Mutex::new(1000),
                fail_routes: false,
            }
        }
        fn failing_routes() -> Self {
            Self {
                fail_routes: true,
                ..Self::new()
            }
        }
        fn cmds(&self) -> Vec<String> {
            self.cmds.lock().unwrap().clone()
        }
        fn record(&self, s: String) {
            self.cmds.lock().unwrap().push(s);
        }
    }

    #[async_trait]
    impl Engine for FakeEngine {
        async fn create_node(&self, name: &str) -> Result<LocalHandle, CommandError> {
            let mut pid = self.next_pid.lock().unwrap();
            *pid += 1;
            self.record(format!("create {name} pid {}", *pid));
            Ok(LocalHandle { pid: *pid })
        }
        async fn destroy_node(&self, name: &str) -> Result<(), CommandError> {
            self.record(format!("destroy {name}"));
            Ok(())
        }
        async fn run_in_node(
            &self,
            handle: LocalHandle,
            cmd: &str,
        ) -> Result<CmdOutput, CommandError> {
            self.record(format!("[{}] {cmd}", handle.pid));
            if self.fail_routes && cmd.contains("ip route add") {
                return Ok(CmdOutput {
                    stdout: String::new(),
                    stderr: "RTNETLINK answers: Network is unreachable\n".into(),
                    code: Some(2),
                });
            }
            Ok(CmdOutput {
                stdout: "4321\n".into(),
                stderr: String::new(),
                code: Some(0),
            })
        }
        fn spawn_in_node(
            &self,
            _handle: LocalHandle,
            argv: &[String],
        ) -> Result<tokio::process::Child, CommandError> {
            Err(CommandError::Spawn {
                cmd: argv.join(" "),
                source: std::io::Error::other("not supported by fake"),
            })
        }
        async fn run_on_host(&self, cmd: &str) -> Result<CmdOutput, CommandError> {
            self.record(format!("[host] {cmd}"));
            Ok(CmdOutput {
                code: Some(0),
                ..Default::default()
            })
        }
        async fn create_veth_pair(
            &self,
            a: LocalHandle,
            ifname_a: &str,
            b: LocalHandle,
            ifname_b: &str,
        ) -> Result<(), CommandError> {
            self.record(format!("veth {ifname_a}@{} {ifname_b}@{}", a.pid, b.pid));
            Ok(())
        }
    }

    /// Scripted status sequence, then pods disappear on demand.
    struct FakeOrchestrator {
        statuses: Mutex<VecDeque<PodStatus>>,
        polls: Mutex<u32>,
    }

    impl FakeOrchestrator {
        fn with_statuses(statuses: Vec<PodStatus>) -> Self {
            Self {
                statuses: Mutex::new(statuses.into()),
                polls: Mutex::new(0),
            }
        }
        fn polls(&self) -> u32 {
            *self.polls.lock().unwrap()
        }
    }

    #[async_trait]
    impl Orchestrator for FakeOrchestrator {
        async fn create_pod(&self, _req: &PodRequest) -> Result<(), OrchestratorError> {
            Ok(())
        }
        async fn pod_status(&self, name: &str) -> Result<PodStatus, OrchestratorError> {
            *self.polls.lock().unwrap() += 1;
            let mut statuses = self.statuses.lock().unwrap();
            if statuses.len() > 1 {
                Ok(statuses.pop_front().unwrap())
            } else {
                statuses
                    .front()
                    .cloned()
                    .ok_or(OrchestratorError::PodNotFound { name: name.into() })
            }
        }
        async fn delete_pod(&self, _name: &str) -> Result<(), OrchestratorError> {
            Ok(())
        }
        async fn exec(&self, _name: &str, _cmd: &str) -> Result<CmdOutput, OrchestratorError> {
            Ok(CmdOutput {
                code: Some(0),
                ..Default::default()
            })
        }
        async fn list_pods(&self, _selector: &str) -> Result<Vec<String>, OrchestratorError> {
            Ok(vec![])
        }
    }

    fn pending() -> PodStatus {
        PodStatus {
            phase: "Pending".into(),
            ip: None,
        }
    }

    fn running(ip: &str) -> PodStatus {
        PodStatus {
            phase: "Running".into(),
            ip: Some(ip.parse().unwrap()),
        }
    }

    #[tokio::test]
    async fn wait_running_returns_only_after_running_report() {
        let orch = FakeOrchestrator::with_statuses(vec![
            pending(),
            pending(),
            pending(),
            running("10.20.0.5"),
        ]);
        let ip = wait_running(&orch, "web", "seclab-web", Duration::from_millis(5), None)
            .await
            .unwrap();
        assert_eq!(ip, "10.20.0.5".parse::<Ipv4Addr>().unwrap());
        assert_eq!(orch.polls(), 4);
    }

    #[tokio::test]
    async fn wait_running_times_out_while_pending() {
        let orch = FakeOrchestrator::with_statuses(vec![pending()]);
        let err = wait_running(
            &orch,
            "web",
            "seclab-web",
            Duration::from_millis(5),
            Some(Duration::from_millis(20)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::SchedulingTimeout { .. }));
    }

    #[tokio::test]
    async fn running_phase_without_ip_is_not_ready() {
        let orch = FakeOrchestrator::with_statuses(vec![
            PodStatus {
                phase: "Running".into(),
                ip: None,
            },
            running("10.20.0.9"),
        ]);
        let ip = wait_running(&orch, "web", "seclab-web", Duration::from_millis(5), None)
            .await
            .unwrap();
        assert_eq!(ip, "10.20.0.9".parse::<Ipv4Addr>().unwrap());
        assert!(orch.polls() >= 2);
    }

    fn local_decl(name: &str, nets: &[&str]) -> NodeDecl {
        NodeDecl {
            name: name.into(),
            kind: NodeKindDecl::Local,
            image: String::new(),
            command: vec![],
            env: vec![],
            mynetworks: nets.iter().map(|n| n.parse().unwrap()).collect(),
            publish: vec![],
            routes: vec![],
            services: vec![],
        }
    }

    fn two_node_config(dir: &std::path::Path) -> Config {
        let mut cfg = Config::default();
        cfg.work_dir = dir.to_path_buf();
        cfg.topology = TopologyDecl {
            nodes: vec![
                local_decl("a", &["10.0.0.0/24"]),
                local_decl("b", &["10.0.1.0/24"]),
            ],
            links: vec![LinkDecl {
                a: "a".into(),
                b: "b".into(),
                a_if: None,
                b_if: None,
                a_addr: Some("10.10.0.1/24".parse().unwrap()),
                b_addr: Some("10.10.0.2/24".parse().unwrap()),
                transport: None,
            }],
        };
        cfg
    }

    #[tokio::test]
    async fn local_bringup_wires_links_and_routes() {
        let dir = std::env::temp_dir().join(format!("seclab-lc-{}", std::process::id()));
        let engine = Arc::new(FakeEngine::new());
        let mut lab = Lab::new(two_node_config(&dir), engine.clone(), None).unwrap();
        lab.start().await.unwrap();
        assert!(lab.failures().is_empty(), "{:?}", lab.failures());
        assert!(lab.topo.nodes.iter().all(|n| n.is_ready()));

        let cmds = engine.cmds();
        assert!(cmds.iter().any(|c| c.contains("veth a-eth0@") && c.contains("b-eth0@")));
        assert!(cmds.iter().any(|c| c.contains("ip addr add 10.10.0.1/24 dev a-eth0")));
        assert!(cmds.iter().any(|c| c.contains("ip route add 10.0.1.0/24 via 10.10.0.2")));
        assert!(cmds.iter().any(|c| c.contains("ip route add 10.0.0.0/24 via 10.10.0.1")));
        assert!(cmds.iter().any(|c| c.contains("ip route add default dev lo")));

        lab.stop().await;
        let cmds = engine.cmds();
        // Reverse declaration order: b is destroyed before a.
        let pos_a = cmds.iter().position(|c| c == "destroy a").unwrap();
        let pos_b = cmds.iter().position(|c| c == "destroy b").unwrap();
        assert!(pos_b < pos_a);
        assert!(lab
            .topo
            .nodes
            .iter()
            .all(|n| n.state == NodeState::Gone));
    }

    #[tokio::test]
    async fn route_install_failures_land_in_the_ledger() {
        let dir = std::env::temp_dir().join(format!("seclab-rf-{}", std::process::id()));
        let engine = Arc::new(FakeEngine::failing_routes());
        let mut lab = Lab::new(two_node_config(&dir), engine.clone(), None).unwrap();
        lab.start().await.unwrap();

        // Nodes and the link come up; only the route commands fail.
        assert!(lab.topo.nodes.iter().all(|n| n.is_ready()));
        assert!(!lab.failures().is_empty());
        assert!(lab
            .failures()
            .iter()
            .any(|(node, err)| (node == "a" || node == "b")
                && err.to_string().contains("Network is unreachable")));
        lab.stop().await;
    }

    #[tokio::test]
    async fn failed_node_degrades_but_does_not_abort() {
        let dir = std::env::temp_dir().join(format!("seclab-deg-{}", std::process::id()));
        let mut cfg = two_node_config(&dir);
        cfg.topology.nodes.push(NodeDecl {
            kind: NodeKindDecl::Remote,
            ..local_decl("pod1", &["10.0.9.0/24"])
        });
        cfg.topology.links.push(LinkDecl {
            a: "b".into(),
            b: "pod1".into(),
            a_if: None,
            b_if: None,
            a_addr: None,
            b_addr: None,
            transport: None,
        });
        let engine = Arc::new(FakeEngine::new());
        // No orchestrator configured: the remote node cannot realize.
        let mut lab = Lab::new(cfg, engine.clone(), None).unwrap();
        lab.start().await.unwrap();

        assert_eq!(lab.topo.node("pod1").unwrap().state, NodeState::Failed);
        assert!(lab.topo.node("a").unwrap().is_ready());
        assert!(lab.topo.node("b").unwrap().is_ready());
        // Both the node and its dependent link are reported.
        assert!(lab.failures().len() >= 2);
        lab.stop().await;
    }
}
