//! Link transport planning and two-sided tunnel negotiation.
//!
//! All mutable tunnel bookkeeping (the per-transport id counters and the
//! interface-name -> session table) lives in one `LinkManager` owned by the
//! lifecycle, behind a mutex: concurrent setup of two links must never
//! allocate the same session id, and ids are never reused in-process so
//! stale kernel state from an earlier session cannot be confused with a
//! live one.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::exec::Ctx;
use crate::topology::{Link, Node, Transport};

/// VXLAN UDP encapsulation port (kernel default for `ip link add`).
const VXLAN_DSTPORT: u16 = 8472;

#[derive(Debug, Clone, Copy)]
struct SessionRecord {
    transport: Transport,
    id: u32,
}

#[derive(Default)]
struct IdState {
    next_vxlan: u32,
    next_l2tp: u32,
    /// Interface name -> session allocated for it, kept for the lifetime of
    /// the process so a re-created link can purge its predecessor first.
    sessions: HashMap<String, SessionRecord>,
}

pub struct LinkManager {
    default_transport: Transport,
    ids: Mutex<IdState>,
}

impl LinkManager {
    pub fn new(default_transport: Transport) -> Self {
        Self {
            default_transport,
            ids: Mutex::new(IdState {
                next_vxlan: 1,
                next_l2tp: 1,
                sessions: HashMap::new(),
            }),
        }
    }

    /// Direct iff both endpoints are local; otherwise the requested tunnel
    /// transport, falling back to the configured default. A request for
    /// Direct between non-local endpoints is not satisfiable and falls back
    /// too.
    pub fn plan(&self, a: &Node, b: &Node, requested: Option<Transport>) -> Transport {
        if a.is_local() && b.is_local() {
            return Transport::Direct;
        }
        match requested {
            Some(Transport::Vxlan) => Transport::Vxlan,
            Some(Transport::L2tp) => Transport::L2tp,
            Some(Transport::Direct) | None => self.default_transport,
        }
    }

    /// Allocate the next session id for a tunnel transport and register both
    /// interface names against it.
    pub(crate) fn allocate(&self, transport: Transport, ifname_a: &str, ifname_b: &str) -> u32 {
        let mut st = self.ids.lock().expect("link id state poisoned");
        let id = match transport {
            Transport::Vxlan => {
                let id = st.next_vxlan;
                st.next_vxlan += 1;
                id
            }
            Transport::L2tp => {
                let id = st.next_l2tp;
                st.next_l2tp += 1;
                id
            }
            Transport::Direct => unreachable!("direct links have no session id"),
        };
        let rec = SessionRecord { transport, id };
        st.sessions.insert(ifname_a.to_string(), rec);
        st.sessions.insert(ifname_b.to_string(), rec);
        id
    }

    fn recorded_session(&self, ifname: &str) -> Option<SessionRecord> {
        self.ids
            .lock()
            .expect("link id state poisoned")
            .sessions
            .get(ifname)
            .copied()
    }

    fn forget(&self, ifname: &str) {
        self.ids
            .lock()
            .expect("link id state poisoned")
            .sessions
            .remove(ifname);
    }

    /// UDP port carrying an L2TP tunnel, derived from its id so concurrent
    /// tunnels on one underlay never collide. The id wraps into the
    /// 17000..=65534 range, so ports stay valid for any id and unique for
    /// the first 48535 sessions.
    pub(crate) fn l2tp_udp_port(id: u32) -> u16 {
        17000 + (id % 48535) as u16
    }

    /// Bring a link up, picking its transport if not already planned.
    pub async fn setup(&self, ctx: Ctx<'_>, a: &Node, b: &Node, link: &mut Link) -> Result<()> {
        for node in [a, b] {
            if !node.is_ready() {
                return Err(Error::NodeNotReady(node.name.clone()));
            }
        }
        let transport = self.plan(a, b, link.transport);
        link.transport = Some(transport);
        debug!("link {}: transport {:?}", link.describe(), transport);

        // Same-named leftovers from an earlier incarnation go first.
        self.purge_stale(ctx, a, &link.a.ifname).await;
        self.purge_stale(ctx, b, &link.b.ifname).await;

        match transport {
            Transport::Direct => {
                let (ha, hb) = match (a.local_handle(), b.local_handle()) {
                    (Some(ha), Some(hb)) => (ha, hb),
                    _ => return Err(Error::NodeNotReady(link.describe())),
                };
                ctx.engine
                    .create_veth_pair(ha, &link.a.ifname, hb, &link.b.ifname)
                    .await?;
            }
            Transport::Vxlan | Transport::L2tp => {
                let (underlay_a, underlay_b) = self.resolve_underlays(ctx, a, b).await?;
                let id = self.allocate(transport, &link.a.ifname, &link.b.ifname);
                let cmd_a = side_command(transport, a, &link.a.ifname, id, underlay_a, underlay_b)?;
                let cmd_b = side_command(transport, b, &link.b.ifname, id, underlay_b, underlay_a)?;
                let out_a = ctx.run_mgmt(a, &cmd_a).await?;
                let out_b = ctx.run_mgmt(b, &cmd_b).await?;
                if !out_a.ok() || !out_b.ok() {
                    return Err(Error::TunnelSetupFailed {
                        link: link.describe(),
                        side_a: format!("`{}`: {}", cmd_a, out_a.text()),
                        side_b: format!("`{}`: {}", cmd_b, out_b.text()),
                    });
                }
            }
        }

        // Addresses and admin-up, inside each endpoint's namespace.
        for (node, ep) in [(a, &link.a), (b, &link.b)] {
            let cmd = match ep.addr {
                Some(addr) => format!(
                    "ip addr add {addr} dev {ifname} && ip link set {ifname} up",
                    ifname = ep.ifname
                ),
                None => format!("ip link set {} up", ep.ifname),
            };
            ctx.run_in(node, &cmd).await?.into_result(&cmd)?;
        }
        Ok(())
    }

    /// Remove a link from both sides. Best-effort: a side that fails leaves
    /// an explicit inconsistency note in the log rather than aborting.
    pub async fn teardown(&self, ctx: Ctx<'_>, a: &Node, b: &Node, link: &Link) -> Result<()> {
        let mut side_ok = [true, true];
        match link.transport {
            Some(Transport::Direct) | None => {
                // Deleting one end of a veth removes its peer; the other side
                // is only tried when the first is already gone.
                let out = ctx.run_in(a, &format!("ip link del {}", link.a.ifname)).await;
                if !matches!(out, Ok(ref o) if o.ok()) {
                    let out_b = ctx.run_in(b, &format!("ip link del {}", link.b.ifname)).await;
                    side_ok = [false, matches!(out_b, Ok(ref o) if o.ok())];
                }
            }
            Some(Transport::Vxlan) => {
                for (i, (node, ep)) in [(a, &link.a), (b, &link.b)].into_iter().enumerate() {
                    let out = ctx.run_in(node, &format!("ip link del {}", ep.ifname)).await;
                    side_ok[i] = matches!(out, Ok(ref o) if o.ok());
                }
            }
            Some(Transport::L2tp) => {
                for (i, (node, ep)) in [(a, &link.a), (b, &link.b)].into_iter().enumerate() {
                    if let Some(rec) = self.recorded_session(&ep.ifname) {
                        let del = format!(
                            "ip l2tp del session tunnel_id {id} session_id {id} && \
                             ip l2tp del tunnel tunnel_id {id}",
                            id = rec.id
                        );
                        let out = ctx.run_mgmt(node, &del).await;
                        side_ok[i] = matches!(out, Ok(ref o) if o.ok());
                    }
                }
            }
        }
        self.forget(&link.a.ifname);
        self.forget(&link.b.ifname);
        if side_ok[0] != side_ok[1] {
            warn!(
                "link {}: inconsistent teardown (a_ok={} b_ok={}), kernel state may linger",
                link.describe(),
                side_ok[0],
                side_ok[1]
            );
        }
        Ok(())
    }

    /// Underlay address per side: a remote node's orchestrator-assigned IP;
    /// a local node uses whatever source address the kernel would pick to
    /// reach the peer's underlay.
    async fn resolve_underlays(
        &self,
        ctx: Ctx<'_>,
        a: &Node,
        b: &Node,
    ) -> Result<(Ipv4Addr, Ipv4Addr)> {
        match (a.underlay(), b.underlay()) {
            (Some(ua), Some(ub)) => Ok((ua, ub)),
            (Some(ua), None) => Ok((ua, derive_source_addr(ctx, b, ua).await?)),
            (None, Some(ub)) => Ok((derive_source_addr(ctx, a, ub).await?, ub)),
            (None, None) => Err(Error::BadTopology(format!(
                "tunnel between {} and {} has no underlay on either side",
                a.name, b.name
            ))),
        }
    }

    /// Best-effort deletion of a previous session with the same interface
    /// name, keyed by the process-wide name -> session table.
    async fn purge_stale(&self, ctx: Ctx<'_>, node: &Node, ifname: &str) {
        if let Some(rec) = self.recorded_session(ifname) {
            if rec.transport == Transport::L2tp {
                let del = format!(
                    "ip l2tp del session tunnel_id {id} session_id {id}; \
                     ip l2tp del tunnel tunnel_id {id}",
                    id = rec.id
                );
                let _ = ctx.run_mgmt(node, &del).await;
            }
        }
        let _ = ctx.run_in(node, &format!("ip link del {ifname}")).await;
    }
}

/// The creation command one side of a tunnel runs, in its management
/// context.
fn side_command(
    transport: Transport,
    node: &Node,
    ifname: &str,
    id: u32,
    my_underlay: Ipv4Addr,
    peer_underlay: Ipv4Addr,
) -> Result<String> {
    let netns = node
        .netns_token()
        .ok_or_else(|| Error::NodeNotReady(node.name.clone()))?;
    match transport {
        // One VXLAN device per side, created straight into the target
        // namespace, learning disabled so live traffic cannot amplify into
        // flooding.
        Transport::Vxlan => Ok(format!(
            "ip link add {ifname} netns {netns} type vxlan id {id} \
             remote {peer_underlay} dstport {VXLAN_DSTPORT} nolearning"
        )),
        // Tunnel, then session, then move the session interface into the
        // target namespace. A pod's command already runs in its own netns,
        // so no move is needed there.
        Transport::L2tp => {
            let port = LinkManager::l2tp_udp_port(id);
            let mut cmd = format!(
                "ip l2tp add tunnel tunnel_id {id} peer_tunnel_id {id} encap udp \
                 local {my_underlay} remote {peer_underlay} \
                 udp_sport {port} udp_dport {port} && \
                 ip l2tp add session name {ifname} tunnel_id {id} \
                 session_id {id} peer_session_id {id}"
            );
            if node.is_local() {
                cmd.push_str(&format!(" && ip link set {ifname} netns {netns}"));
            }
            Ok(cmd)
        }
        Transport::Direct => unreachable!("direct links are wired by the engine"),
    }
}

/// Ask the kernel which source address it would use toward the peer's
/// underlay (`ip route get` on the management side of the node).
async fn derive_source_addr(ctx: Ctx<'_>, node: &Node, peer: Ipv4Addr) -> Result<Ipv4Addr> {
    let cmd = format!("ip route get {peer}");
    let out = ctx.run_mgmt(node, &cmd).await?.into_result(&cmd)?;
    parse_source_addr(&out).ok_or_else(|| {
        Error::BadTopology(format!(
            "cannot derive underlay for {} toward {peer}: {out}",
            node.name
        ))
    })
}

fn parse_source_addr(route_get: &str) -> Option<Ipv4Addr> {
    let mut tokens = route_get.split_whitespace();
    while let Some(tok) = tokens.next() {
        if tok == "src" {
            return tokens.next().and_then(|s| s.parse().ok());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::engine::{Engine, LocalHandle};
    use crate::error::{CommandError, OrchestratorError};
    use crate::exec::CmdOutput;
    use crate::orchestrator::{Orchestrator, PodRequest, PodStatus};
    use crate::topology::{Endpoint, NodeHandle, NodeKind, NodeState};

    fn node(name: &str, local: bool) -> Node {
        Node {
            name: name.to_string(),
            kind: if local {
                NodeKind::Local
            } else {
                NodeKind::Remote {
                    image: "img".into(),
                    command: vec![],
                    env: vec![],
                }
            },
            mynetworks: vec![],
            extra_routes: vec![],
            publish: vec![],
            services: vec![],
            state: NodeState::Ready,
            handle: Some(if local {
                NodeHandle::Local(LocalHandle { pid: 4242 })
            } else {
                NodeHandle::Remote {
                    pod_name: format!("seclab-{name}"),
                    pod_ip: Some("10.20.0.5".parse().unwrap()),
                }
            }),
            service_pids: vec![],
        }
    }

    #[test]
    fn plan_direct_iff_both_local() {
        let mgr = LinkManager::new(Transport::L2tp);
        for (a_local, b_local) in [(true, true), (true, false), (false, true), (false, false)] {
            let a = node("a", a_local);
            let b = node("b", b_local);
            let planned = mgr.plan(&a, &b, None);
            if a_local && b_local {
                assert_eq!(planned, Transport::Direct);
            } else {
                assert_eq!(planned, Transport::L2tp);
            }
        }
    }

    #[test]
    fn plan_honors_per_link_override_for_tunnels_only() {
        let mgr = LinkManager::new(Transport::L2tp);
        let local = node("a", true);
        let remote = node("b", false);
        assert_eq!(
            mgr.plan(&local, &remote, Some(Transport::Vxlan)),
            Transport::Vxlan
        );
        // Direct is never satisfiable with a remote endpoint.
        assert_eq!(
            mgr.plan(&local, &remote, Some(Transport::Direct)),
            Transport::L2tp
        );
        // And two local endpoints are always wired directly.
        assert_eq!(
            mgr.plan(&local, &node("c", true), Some(Transport::Vxlan)),
            Transport::Direct
        );
    }

    #[test]
    fn session_ids_unique_under_concurrent_allocation() {
        let mgr = Arc::new(LinkManager::new(Transport::L2tp));
        let mut handles = Vec::new();
        for i in 0..100 {
            let mgr = Arc::clone(&mgr);
            handles.push(std::thread::spawn(move || {
                mgr.allocate(Transport::L2tp, &format!("if{i}a"), &format!("if{i}b"))
            }));
        }
        let ids: HashSet<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn session_ids_are_scoped_per_transport() {
        let mgr = LinkManager::new(Transport::L2tp);
        assert_eq!(mgr.allocate(Transport::Vxlan, "v0a", "v0b"), 1);
        assert_eq!(mgr.allocate(Transport::L2tp, "l0a", "l0b"), 1);
        assert_eq!(mgr.allocate(Transport::Vxlan, "v1a", "v1b"), 2);
        assert_eq!(mgr.allocate(Transport::L2tp, "l1a", "l1b"), 2);
    }

    #[test]
    fn allocation_is_remembered_per_interface_name() {
        let mgr = LinkManager::new(Transport::L2tp);
        let id = mgr.allocate(Transport::L2tp, "r1-eth0", "pod1-eth0");
        let rec = mgr.recorded_session("pod1-eth0").unwrap();
        assert_eq!(rec.id, id);
        mgr.forget("pod1-eth0");
        assert!(mgr.recorded_session("pod1-eth0").is_none());
        assert!(mgr.recorded_session("r1-eth0").is_some());
    }

    #[test]
    fn parses_kernel_source_address() {
        let out = "10.20.0.5 via 10.0.2.2 dev eth0 src 10.0.2.15 uid 0\n    cache\n";
        assert_eq!(
            parse_source_addr(out),
            Some("10.0.2.15".parse::<Ipv4Addr>().unwrap())
        );
        assert_eq!(parse_source_addr("10.20.0.5 dev eth0\n"), None);
    }

    #[test]
    fn l2tp_port_tracks_session_id_and_stays_in_port_range() {
        assert_eq!(LinkManager::l2tp_udp_port(1), 17001);
        assert_ne!(
            LinkManager::l2tp_udp_port(3),
            LinkManager::l2tp_udp_port(4)
        );
        // Very large ids wrap instead of overflowing the port space.
        assert!(LinkManager::l2tp_udp_port(u32::MAX) >= 17000);
        assert_eq!(LinkManager::l2tp_udp_port(48536), 17001);
    }

    #[test]
    fn side_commands_match_transport_shape() {
        let local = node("r1", true);
        let remote = node("pod1", false);
        let my: Ipv4Addr = "10.0.2.15".parse().unwrap();
        let peer: Ipv4Addr = "10.20.0.5".parse().unwrap();

        let vx = side_command(Transport::Vxlan, &local, "r1-eth0", 7, my, peer).unwrap();
        assert_eq!(
            vx,
            "ip link add r1-eth0 netns 4242 type vxlan id 7 \
             remote 10.20.0.5 dstport 8472 nolearning"
        );

        let l2 = side_command(Transport::L2tp, &local, "r1-eth0", 7, my, peer).unwrap();
        assert!(l2.contains("udp_sport 17007 udp_dport 17007"));
        assert!(l2.contains("local 10.0.2.15 remote 10.20.0.5"));
        assert!(l2.ends_with("ip link set r1-eth0 netns 4242"));

        // The pod side already runs inside its own namespace; no move.
        let pod = side_command(Transport::L2tp, &remote, "pod1-eth0", 7, peer, my).unwrap();
        assert!(pod.contains("local 10.20.0.5 remote 10.0.2.15"));
        assert!(!pod.contains("ip link set"));
    }

    /// Underlay derivation succeeds but both tunnel commands fail: the local
    /// side with kernel stderr, the pod side with exec stderr.
    struct HalfBrokenEngine;

    #[async_trait]
    impl Engine for HalfBrokenEngine {
        async fn create_node(&self, _name: &str) -> Result<LocalHandle, CommandError> {
            Ok(LocalHandle { pid: 4242 })
        }
        async fn destroy_node(&self, _name: &str) -> Result<(), CommandError> {
            Ok(())
        }
        async fn run_in_node(
            &self,
            _handle: LocalHandle,
            _cmd: &str,
        ) -> Result<CmdOutput, CommandError> {
            Ok(CmdOutput {
                code: Some(0),
                ..Default::default()
            })
        }
        fn spawn_in_node(
            &self,
            _handle: LocalHandle,
            argv: &[String],
        ) -> Result<tokio::process::Child, CommandError> {
            Err(CommandError::Spawn {
                cmd: argv.join(" "),
                source: std::io::Error::other("not supported here"),
            })
        }
        async fn run_on_host(&self, cmd: &str) -> Result<CmdOutput, CommandError> {
            if cmd.starts_with("ip route get") {
                Ok(CmdOutput {
                    stdout: "10.20.0.5 dev eth0 src 10.0.2.15 uid 0\n".into(),
                    stderr: String::new(),
                    code: Some(0),
                })
            } else {
                Ok(CmdOutput {
                    stdout: String::new(),
                    stderr: "RTNETLINK answers: File exists\n".into(),
                    code: Some(2),
                })
            }
        }
        async fn create_veth_pair(
            &self,
            _a: LocalHandle,
            _ifa: &str,
            _b: LocalHandle,
            _ifb: &str,
        ) -> Result<(), CommandError> {
            Ok(())
        }
    }

    struct BrokenExecOrchestrator;

    #[async_trait]
    impl Orchestrator for BrokenExecOrchestrator {
        async fn create_pod(&self, _req: &PodRequest) -> Result<(), OrchestratorError> {
            Ok(())
        }
        async fn pod_status(&self, _name: &str) -> Result<PodStatus, OrchestratorError> {
            Ok(PodStatus::default())
        }
        async fn delete_pod(&self, _name: &str) -> Result<(), OrchestratorError> {
            Ok(())
        }
        async fn exec(&self, _name: &str, _cmd: &str) -> Result<CmdOutput, OrchestratorError> {
            Ok(CmdOutput {
                stdout: String::new(),
                stderr: "Error: tunnel busy\n".into(),
                code: Some(1),
            })
        }
        async fn list_pods(&self, _selector: &str) -> Result<Vec<String>, OrchestratorError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn tunnel_setup_failure_carries_both_sides_raw_output() {
        let mgr = LinkManager::new(Transport::L2tp);
        let a = node("r1", true);
        let b = node("pod1", false);
        let mut link = Link {
            a: Endpoint {
                node: "r1".into(),
                ifname: "r1-eth0".into(),
                addr: Some("10.30.0.1/24".parse().unwrap()),
            },
            b: Endpoint {
                node: "pod1".into(),
                ifname: "pod1-eth0".into(),
                addr: Some("10.30.0.2/24".parse().unwrap()),
            },
            transport: None,
        };
        let engine = HalfBrokenEngine;
        let orch = BrokenExecOrchestrator;
        let ctx = Ctx {
            engine: &engine,
            orch: Some(&orch),
        };

        let err = mgr.setup(ctx, &a, &b, &mut link).await.unwrap_err();
        let Error::TunnelSetupFailed {
            link: which,
            side_a,
            side_b,
        } = err
        else {
            panic!("wrong error: {err}");
        };
        assert_eq!(which, "r1:r1-eth0<->pod1:pod1-eth0");
        // Each side carries its own command and its raw output, verbatim.
        assert!(side_a.contains("ip l2tp add tunnel"));
        assert!(side_a.contains("RTNETLINK answers: File exists"));
        assert!(side_b.contains("ip l2tp add tunnel"));
        assert!(side_b.contains("Error: tunnel busy"));
    }
}
