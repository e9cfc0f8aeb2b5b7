//! Static route computation and installation.
//!
//! The graph is rebuilt from scratch on every pass: one vertex per node
//! that owns at least one subnet, one edge per link between two such nodes
//! carrying each side's address. Routes follow *all* hop-count-shortest
//! paths, are deduplicated per (node, subnet, next-hop) within a pass, and
//! are additive only across passes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use log::{debug, info, warn};

use crate::error::{CommandError, Error, Result};
use crate::exec::Ctx;
use crate::topology::Topology;

/// Metric of the per-source loopback default: high enough that it is never
/// preferred over any concrete route, present so loose-mode rp_filter still
/// admits return traffic.
const LOOPBACK_DEFAULT_METRIC: u32 = 4294967295;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteEntry {
    pub node: String,
    pub dest: Ipv4Net,
    pub via: Ipv4Addr,
}

/// Everything one computation pass decided, before any command runs.
#[derive(Debug, Default)]
pub struct RoutePlan {
    pub routes: Vec<RouteEntry>,
    /// Nodes that get the low-priority loopback default.
    pub defaults: Vec<String>,
    /// Vertex pairs with no path; expected for disconnected domains.
    pub unreachable: Vec<(String, String)>,
}

struct Edge {
    to: usize,
    /// This vertex's address on the edge; the next hop seen from `to`.
    local_addr: Ipv4Addr,
}

struct Graph {
    names: Vec<String>,
    subnets: Vec<Vec<Ipv4Net>>,
    adj: Vec<Vec<Edge>>,
}

impl Graph {
    fn build(topo: &Topology) -> Self {
        let mut names = Vec::new();
        let mut subnets = Vec::new();
        let mut index = HashMap::new();
        for node in &topo.nodes {
            // A node that owns no subnet is never a routing vertex; a node
            // that is not Ready must not appear as a hop or a destination.
            if node.mynetworks.is_empty() || !node.is_ready() {
                continue;
            }
            index.insert(node.name.clone(), names.len());
            names.push(node.name.clone());
            subnets.push(node.mynetworks.clone());
        }
        let mut adj: Vec<Vec<Edge>> = (0..names.len()).map(|_| Vec::new()).collect();
        for link in &topo.links {
            // Self-loops and links without both addresses cannot carry a
            // next hop.
            if link.a.node == link.b.node {
                continue;
            }
            let (Some(&ia), Some(&ib)) = (index.get(&link.a.node), index.get(&link.b.node))
            else {
                continue;
            };
            let (Some(addr_a), Some(addr_b)) = (link.a.addr, link.b.addr) else {
                debug!(
                    "routing: skipping link {} (missing side address)",
                    link.describe()
                );
                continue;
            };
            adj[ia].push(Edge {
                to: ib,
                local_addr: addr_a.addr(),
            });
            adj[ib].push(Edge {
                to: ia,
                local_addr: addr_b.addr(),
            });
        }
        Graph {
            names,
            subnets,
            adj,
        }
    }

    /// BFS distances plus, for each vertex, the set of predecessors that lie
    /// on some shortest path from `src`.
    fn shortest_dag(&self, src: usize) -> (Vec<Option<u32>>, Vec<Vec<usize>>) {
        let mut dist: Vec<Option<u32>> = vec![None; self.names.len()];
        let mut preds: Vec<Vec<usize>> = vec![Vec::new(); self.names.len()];
        dist[src] = Some(0);
        let mut queue = VecDeque::from([src]);
        while let Some(u) = queue.pop_front() {
            let du = dist[u].unwrap_or(0);
            for e in &self.adj[u] {
                match dist[e.to] {
                    None => {
                        dist[e.to] = Some(du + 1);
                        preds[e.to].push(u);
                        queue.push_back(e.to);
                    }
                    Some(dv) if dv == du + 1 && !preds[e.to].contains(&u) => {
                        preds[e.to].push(u);
                    }
                    Some(_) => {}
                }
            }
        }
        (dist, preds)
    }

    /// Every shortest path src..=dst, as vertex sequences.
    fn all_shortest_paths(&self, preds: &[Vec<usize>], src: usize, dst: usize) -> Vec<Vec<usize>> {
        let mut paths = Vec::new();
        let mut stack = vec![dst];
        self.backtrack(preds, src, dst, &mut stack, &mut paths);
        paths
    }

    fn backtrack(
        &self,
        preds: &[Vec<usize>],
        src: usize,
        cur: usize,
        stack: &mut Vec<usize>,
        paths: &mut Vec<Vec<usize>>,
    ) {
        if cur == src {
            let mut path = stack.clone();
            path.reverse();
            paths.push(path);
            return;
        }
        for &p in &preds[cur] {
            stack.push(p);
            self.backtrack(preds, src, p, stack, paths);
            stack.pop();
        }
    }
}

/// Compute the full route plan for the current topology. Pure: no commands
/// are issued, so a plan can be inspected (and tested) before installation.
pub fn compute(topo: &Topology) -> RoutePlan {
    let graph = Graph::build(topo);
    let mut plan = RoutePlan::default();
    let mut installed: HashSet<(usize, Ipv4Net, Ipv4Addr)> = HashSet::new();

    for src in 0..graph.names.len() {
        let (dist, preds) = graph.shortest_dag(src);
        for dst in 0..graph.names.len() {
            if dst == src {
                continue;
            }
            if dist[dst].is_none() {
                plan.unreachable
                    .push((graph.names[src].clone(), graph.names[dst].clone()));
                continue;
            }
            for path in graph.all_shortest_paths(&preds, src, dst) {
                for hop in 1..path.len() {
                    let prev = path[hop - 1];
                    let cur = path[hop];
                    // The next hop toward `src` is the previous hop's
                    // address on every edge joining the two, so each
                    // equal-cost parallel edge contributes.
                    for edge in graph.adj[prev].iter().filter(|e| e.to == cur) {
                        for &subnet in &graph.subnets[src] {
                            if installed.insert((cur, subnet, edge.local_addr)) {
                                plan.routes.push(RouteEntry {
                                    node: graph.names[cur].clone(),
                                    dest: subnet,
                                    via: edge.local_addr,
                                });
                            }
                        }
                    }
                }
            }
        }
        plan.defaults.push(graph.names[src].clone());
    }
    plan
}

/// Recompute the plan and issue the installation commands, returning the
/// per-node failures for the caller's ledger. Not incremental; safe (thanks
/// to in-pass dedup) but not cheap to call after mutations.
pub async fn compute_and_install(
    topo: &Topology,
    ctx: Ctx<'_>,
) -> Result<Vec<(String, Error)>> {
    let plan = compute(topo);
    for (src, dst) in &plan.unreachable {
        warn!("routing: no path between {src} and {dst}, skipping pair");
    }
    let mut issued = 0usize;
    let mut failed = Vec::new();
    for entry in &plan.routes {
        let node = topo.require(&entry.node)?;
        let cmd = format!("ip route add {} via {}", entry.dest, entry.via);
        match ctx.run_in(node, &cmd).await {
            Ok(out) if out.ok() => issued += 1,
            Ok(out) => {
                warn!("routing: {} on {} failed: {}", cmd, entry.node, out.text());
                failed.push((
                    entry.node.clone(),
                    CommandError::Failed {
                        cmd,
                        code: out.code,
                        stderr: out.text(),
                    }
                    .into(),
                ));
            }
            Err(e) => {
                warn!("routing: {} on {} failed: {}", cmd, entry.node, e);
                failed.push((entry.node.clone(), e));
            }
        }
    }
    for name in &plan.defaults {
        let node = topo.require(name)?;
        let cmd = format!("ip route add default dev lo metric {LOOPBACK_DEFAULT_METRIC}");
        match ctx.run_in(node, &cmd).await {
            Ok(out) if out.ok() => {}
            Ok(out) => {
                warn!("routing: loopback default on {name} failed: {}", out.text());
                failed.push((
                    name.clone(),
                    CommandError::Failed {
                        cmd,
                        code: out.code,
                        stderr: out.text(),
                    }
                    .into(),
                ));
            }
            Err(e) => {
                warn!("routing: loopback default on {name} failed: {e}");
                failed.push((name.clone(), e));
            }
        }
    }
    info!(
        "routing: installed {issued}/{} routes across {} nodes",
        plan.routes.len(),
        plan.defaults.len()
    );
    Ok(failed)
}
