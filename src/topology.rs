//! The node/link data model. Node and link behavior is dispatched over
//! closed enums rather than downcasting: a node is Local or Remote, a link
//! is Direct, Vxlan or L2tp, and every consumer matches exhaustively.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::config::{LinkDecl, NodeDecl, NodeKindDecl, PublishSpec, ServiceDecl, TopologyDecl};
use crate::engine::LocalHandle;
use crate::error::{Error, Result};

/// Link transport. Direct only ever connects two local nodes; everything
/// else is carried by a tunnel over the management network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Direct,
    Vxlan,
    L2tp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Declared,
    Realizing,
    Ready,
    Terminating,
    Gone,
    /// Realization failed; the node must not appear as a link or route
    /// endpoint.
    Failed,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Local,
    Remote {
        image: String,
        command: Vec<String>,
        env: Vec<(String, String)>,
    },
}

/// How a realized node is addressed. A remote node's IP stays `None` until
/// the orchestrator reports it Running.
#[derive(Debug, Clone)]
pub enum NodeHandle {
    Local(LocalHandle),
    Remote {
        pod_name: String,
        pod_ip: Option<Ipv4Addr>,
    },
}

#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    /// Subnets this node declares as locally reachable; the destination set
    /// when computing routes toward it.
    pub mynetworks: Vec<Ipv4Net>,
    /// Additional static routes installed verbatim after the computed ones.
    pub extra_routes: Vec<(Ipv4Net, Ipv4Addr)>,
    pub publish: Vec<PublishSpec>,
    pub services: Vec<ServiceDecl>,
    pub state: NodeState,
    pub handle: Option<NodeHandle>,
    /// Pids of post-start services running inside the node.
    pub service_pids: Vec<(String, u32)>,
}

impl Node {
    pub fn is_local(&self) -> bool {
        matches!(self.kind, NodeKind::Local)
    }

    pub fn is_ready(&self) -> bool {
        self.state == NodeState::Ready
    }

    /// The underlay address tunnels to this node encapsulate over, known
    /// only for a scheduled remote node. Local nodes derive theirs from the
    /// kernel's route toward the peer instead.
    pub fn underlay(&self) -> Option<Ipv4Addr> {
        match &self.handle {
            Some(NodeHandle::Remote { pod_ip, .. }) => *pod_ip,
            _ => None,
        }
    }

    pub fn local_handle(&self) -> Option<LocalHandle> {
        match &self.handle {
            Some(NodeHandle::Local(h)) => Some(*h),
            _ => None,
        }
    }

    /// Namespace token for `ip link add ... netns <token>`: the anchor pid
    /// for a local node; pid 1 when the command already runs inside the pod.
    pub fn netns_token(&self) -> Option<String> {
        match &self.handle {
            Some(NodeHandle::Local(h)) => Some(h.pid.to_string()),
            Some(NodeHandle::Remote { .. }) => Some("1".to_string()),
            None => None,
        }
    }
}

/// One side of a link: the node, the interface name created on it, and the
/// address assigned to that interface (if declared).
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub node: String,
    pub ifname: String,
    pub addr: Option<Ipv4Net>,
}

#[derive(Debug, Clone)]
pub struct Link {
    pub a: Endpoint,
    pub b: Endpoint,
    /// Chosen at setup time; `Some` once planned.
    pub transport: Option<Transport>,
}

impl Link {
    /// Human-readable identity for diagnostics.
    pub fn describe(&self) -> String {
        format!(
            "{}:{}<->{}:{}",
            self.a.node, self.a.ifname, self.b.node, self.b.ifname
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct Topology {
    /// Declaration order is preserved; teardown walks it in reverse.
    pub nodes: Vec<Node>,
    pub links: Vec<Link>,
}

impl Topology {
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.name == name)
    }

    pub fn require(&self, name: &str) -> Result<&Node> {
        self.node(name)
            .ok_or_else(|| Error::UnknownNode(name.to_string()))
    }

    /// Build the runtime topology from its declaration, assigning default
    /// interface names (`<node>-eth<n>`) and parsing publish specs.
    pub fn build(decl: &TopologyDecl) -> Result<Self> {
        let mut topo = Topology::default();
        for nd in &decl.nodes {
            if topo.node(&nd.name).is_some() {
                return Err(Error::BadTopology(format!("duplicate node {}", nd.name)));
            }
            topo.nodes.push(Node::from_decl(nd)?);
        }
        let mut ifcount = std::collections::HashMap::new();
        for ld in &decl.links {
            for side in [&ld.a, &ld.b] {
                if topo.node(side).is_none() {
                    return Err(Error::BadTopology(format!(
                        "link references unknown node {side}"
                    )));
                }
            }
            let mut next_ifname = |node: &str| {
                let n = ifcount.entry(node.to_string()).or_insert(0u32);
                let name = format!("{node}-eth{n}");
                *n += 1;
                name
            };
            let ifname_a = ld.a_if.clone().unwrap_or_else(|| next_ifname(&ld.a));
            let ifname_b = ld.b_if.clone().unwrap_or_else(|| next_ifname(&ld.b));
            topo.links.push(Link {
                a: Endpoint {
                    node: ld.a.clone(),
                    ifname: ifname_a,
                    addr: ld.a_addr,
                },
                b: Endpoint {
                    node: ld.b.clone(),
                    ifname: ifname_b,
                    addr: ld.b_addr,
                },
                transport: ld.transport,
            });
        }
        Ok(topo)
    }
}

impl Node {
    pub fn from_decl(decl: &NodeDecl) -> Result<Self> {
        let kind = match decl.kind {
            NodeKindDecl::Local => NodeKind::Local,
            NodeKindDecl::Remote => NodeKind::Remote {
                image: decl.image.clone(),
                command: decl.command.clone(),
                env: decl
                    .env
                    .iter()
                    .map(|e| (e.name.clone(), e.value.clone()))
                    .collect(),
            },
        };
        let publish = decl
            .publish
            .iter()
            .map(|s| s.parse())
            .collect::<Result<Vec<_>>>()?;
        Ok(Node {
            name: decl.name.clone(),
            kind,
            mynetworks: decl.mynetworks.clone(),
            extra_routes: decl.routes.iter().map(|r| (r.dest, r.via)).collect(),
            publish,
            services: decl.services.clone(),
            state: NodeState::Declared,
            handle: None,
            service_pids: Vec::new(),
        })
    }
}
