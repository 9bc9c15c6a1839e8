//! Observational topology tracker (§4.7).
//!
//! Not on the hot path: `RoutingMiddleware` feeds it two kinds of
//! edges as a side effect of handling subscriptions and neighbor
//! announcements it would be computing anyway — self-subscriber edges
//! when a session is promoted, and node-neighbor edges when a
//! `routing/announcement/neighbors` object is observed in transit. This
//! crate has no standalone MST-style helper to ground it on (that one
//! is out of scope per §1), so it is a fresh build in the surrounding
//! code's idiom rather than a translation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::RwLock;

#[derive(Default)]
pub struct Topology {
    edges: RwLock<HashMap<String, HashSet<String>>>,
    servers: RwLock<HashSet<String>>,
}

impl Topology {
    pub fn new() -> Self {
        Topology::default()
    }

    /// Tags `routing_id` as a server (peer broker) rather than a plain
    /// client, for the textual dump (§4.7 "servers tagged distinctly").
    pub fn mark_server(&self, routing_id: &str) {
        self.servers.write().unwrap().insert(routing_id.to_owned());
    }

    pub fn is_server(&self, routing_id: &str) -> bool {
        self.servers.read().unwrap().contains(routing_id)
    }

    /// Records an undirected edge between two routing-ids, creating
    /// either endpoint as a node if it isn't one already.
    pub fn record_edge(&self, a: &str, b: &str) {
        if a.is_empty() || b.is_empty() || a == b {
            return;
        }
        let mut edges = self.edges.write().unwrap();
        edges.entry(a.to_owned()).or_default().insert(b.to_owned());
        edges.entry(b.to_owned()).or_default().insert(a.to_owned());
    }

    /// Records a neighbor announcement: `node` is directly connected to
    /// every id in `neighbors` (§4.7 (ii)).
    pub fn record_announcement(&self, node: &str, neighbors: &[String]) {
        for neighbor in neighbors {
            self.record_edge(node, neighbor);
        }
    }

    /// BFS shortest path between two routing-ids, inclusive of both
    /// endpoints. `None` if either node is unknown or unreachable.
    pub fn shortest_path(&self, from: &str, to: &str) -> Option<Vec<String>> {
        let edges = self.edges.read().unwrap();
        if !edges.contains_key(from) {
            return None;
        }
        if from == to {
            return Some(vec![from.to_owned()]);
        }

        let mut visited: HashSet<&str> = HashSet::new();
        let mut predecessor: HashMap<&str, &str> = HashMap::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        visited.insert(from);
        queue.push_back(from);

        while let Some(current) = queue.pop_front() {
            let Some(neighbors) = edges.get(current) else {
                continue;
            };
            for neighbor in neighbors {
                if visited.contains(neighbor.as_str()) {
                    continue;
                }
                visited.insert(neighbor);
                predecessor.insert(neighbor, current);
                if neighbor == to {
                    let mut path = vec![to.as_str()];
                    let mut cursor = current;
                    path.push(cursor);
                    while let Some(&prev) = predecessor.get(cursor) {
                        path.push(prev);
                        cursor = prev;
                    }
                    path.reverse();
                    return Some(path.into_iter().map(str::to_owned).collect());
                }
                queue.push_back(neighbor);
            }
        }
        None
    }

    /// A stable, human-readable dump: one `node -> [neighbors]` line
    /// per node, sorted by routing-id (§4.7 "textual graph dump").
    pub fn dump(&self) -> String {
        let edges = self.edges.read().unwrap();
        let mut nodes: Vec<&String> = edges.keys().collect();
        nodes.sort();

        let mut out = String::new();
        for node in nodes {
            let mut neighbors: Vec<&String> = edges[node].iter().collect();
            neighbors.sort();
            let tag = if self.is_server(node) { " [server]" } else { "" };
            out.push_str(&format!(
                "{node}{tag} -> [{}]\n",
                neighbors
                    .iter()
                    .map(|n| n.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_edge_is_symmetric() {
        let topo = Topology::new();
        topo.record_edge("broker1", "client1");
        assert_eq!(topo.shortest_path("client1", "broker1"), Some(vec!["client1".into(), "broker1".into()]));
    }

    #[test]
    fn shortest_path_through_two_hops() {
        let topo = Topology::new();
        topo.record_edge("a", "b");
        topo.record_edge("b", "c");
        assert_eq!(
            topo.shortest_path("a", "c"),
            Some(vec!["a".to_owned(), "b".to_owned(), "c".to_owned()])
        );
    }

    #[test]
    fn unknown_node_has_no_path() {
        let topo = Topology::new();
        topo.record_edge("a", "b");
        assert_eq!(topo.shortest_path("a", "z"), None);
    }

    #[test]
    fn announcement_wires_node_to_each_neighbor() {
        let topo = Topology::new();
        topo.record_announcement("broker1", &["broker2".to_owned(), "broker3".to_owned()]);
        assert!(topo.shortest_path("broker2", "broker3").is_some());
    }

    #[test]
    fn dump_tags_servers() {
        let topo = Topology::new();
        topo.record_edge("broker1", "client1");
        topo.mark_server("broker1");
        let dump = topo.dump();
        assert!(dump.contains("broker1 [server] -> [client1]"));
    }
}
