//! Locally known topology and next-hop routing.
//!
//! [`ConnectionGraph`] records which nodes are adjacent to which, as far as
//! this node knows.  On demand it builds a breadth-first spanning tree rooted
//! at the local address and flattens it into a [`RoutingTable`]:
//!
//! ```text
//!   a ── b ── c ── d          tree rooted at a        table
//!   │                         a                       b → b
//!   e                         ├── b                   c → b
//!                             │   └── c               d → b
//!                             │       └── d           e → e
//!                             └── e
//! ```
//!
//! Every destination maps to the root child whose subtree contains it.  The
//! tree is computed from a snapshot and never updated incrementally.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Destination address → directly connected next hop.
pub type RoutingTable = BTreeMap<String, String>;

/// One node of a spanning tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTreeNode {
    /// Node address.
    pub address: String,
    /// Nodes first reached through this one, in BFS order.
    pub children: Vec<RoutingTreeNode>,
}

impl RoutingTreeNode {
    fn leaf(address: String) -> Self {
        Self {
            address,
            children: Vec::new(),
        }
    }

    /// Nodes in this subtree, including `self`.
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(RoutingTreeNode::size).sum::<usize>()
    }

    /// Addresses in this subtree, parents before children.
    pub fn addresses(&self) -> Vec<&str> {
        let mut out = Vec::with_capacity(self.size());
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            out.push(node.address.as_str());
            stack.extend(node.children.iter().rev());
        }
        out
    }
}

/// Undirected adjacency between node addresses.
///
/// Neighbour lists keep insertion order, which makes tree construction
/// deterministic for a given history of updates.
#[derive(Debug, Clone)]
pub struct ConnectionGraph {
    address: String,
    connections: HashMap<String, Vec<String>>,
}

impl ConnectionGraph {
    /// A graph holding only the local node, with no neighbours.
    pub fn new(address: impl Into<String>) -> Self {
        let address = address.into();
        let mut connections = HashMap::new();
        connections.insert(address.clone(), Vec::new());
        Self {
            address,
            connections,
        }
    }

    /// The local address the tree is rooted at.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Register `address` with no neighbours; a no-op if it is known.
    pub fn add_node(&mut self, address: impl Into<String>) {
        self.connections.entry(address.into()).or_default();
    }

    /// Forget `address` and its neighbour list.
    ///
    /// Other nodes that list `address` as a neighbour keep that entry;
    /// tree construction skips it.
    pub fn remove_node(&mut self, address: &str) -> bool {
        self.connections.remove(address).is_some()
    }

    /// Replace the neighbour list of `address` with exactly `neighbours`,
    /// registering any of them that are not known yet.
    pub fn set_node_neighbours<I, S>(&mut self, address: impl Into<String>, neighbours: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut list: Vec<String> = Vec::new();
        for neighbour in neighbours {
            let neighbour = neighbour.into();
            if !list.contains(&neighbour) {
                list.push(neighbour);
            }
        }
        for neighbour in &list {
            self.add_node(neighbour.clone());
        }
        self.connections.insert(address.into(), list);
    }

    /// Record an undirected edge.
    pub fn add_connection(&mut self, a: &str, b: &str) {
        link(self.connections.entry(a.to_owned()).or_default(), b);
        link(self.connections.entry(b.to_owned()).or_default(), a);
    }

    /// Remove an undirected edge; returns `false` if neither direction existed.
    pub fn remove_connection(&mut self, a: &str, b: &str) -> bool {
        let forward = self.unlink(a, b);
        let backward = self.unlink(b, a);
        forward || backward
    }

    fn unlink(&mut self, from: &str, to: &str) -> bool {
        match self.connections.get_mut(from) {
            Some(list) => {
                let before = list.len();
                list.retain(|n| n != to);
                list.len() != before
            }
            None => false,
        }
    }

    /// Neighbour list of `address`, if it is registered.
    pub fn neighbours(&self, address: &str) -> Option<&[String]> {
        self.connections.get(address).map(Vec::as_slice)
    }

    /// Whether `address` is a registered node.
    pub fn contains(&self, address: &str) -> bool {
        self.connections.contains_key(address)
    }

    /// Registered addresses, sorted.
    pub fn nodes(&self) -> Vec<&str> {
        let mut nodes: Vec<&str> = self.connections.keys().map(String::as_str).collect();
        nodes.sort_unstable();
        nodes
    }

    /// Number of registered nodes, including the local one.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no node is registered.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Breadth-first spanning tree rooted at the local address.
    ///
    /// The first path to reach a node wins, so every node hangs off the
    /// tree at its shortest hop distance from the root.
    pub fn construct_routing_tree(&self) -> RoutingTreeNode {
        // Arena of (address, child arena indices); entry 0 is the root.
        let mut arena: Vec<(String, Vec<usize>)> = vec![(self.address.clone(), Vec::new())];
        let mut visited: HashSet<&str> = HashSet::from([self.address.as_str()]);
        let mut queue: VecDeque<(&str, usize)> = VecDeque::new();

        for neighbour in self.neighbours(&self.address).unwrap_or_default() {
            queue.push_back((neighbour, 0));
        }

        while let Some((address, parent)) = queue.pop_front() {
            if visited.contains(address) {
                continue;
            }
            let Some(neighbours) = self.neighbours(address) else {
                log::debug!("[graph] skipping unregistered neighbour {address}");
                continue;
            };
            visited.insert(address);

            let id = arena.len();
            arena.push((address.to_owned(), Vec::new()));
            arena[parent].1.push(id);

            for neighbour in neighbours {
                queue.push_back((neighbour, id));
            }
        }

        assemble(&mut arena, 0)
    }

    /// Next hop for every node reachable from the local address.
    ///
    /// The local address itself has no entry.
    pub fn make_routing_table(&self) -> RoutingTable {
        let tree = self.construct_routing_tree();
        let mut table = RoutingTable::new();
        for child in &tree.children {
            for address in child.addresses() {
                table.insert(address.to_owned(), child.address.clone());
            }
        }
        log::debug!(
            "[graph] {} routing table: {} destination(s) via {} neighbour(s)",
            self.address,
            table.len(),
            tree.children.len()
        );
        table
    }
}

fn link(list: &mut Vec<String>, to: &str) {
    if !list.iter().any(|n| n == to) {
        list.push(to.to_owned());
    }
}

fn assemble(arena: &mut [(String, Vec<usize>)], id: usize) -> RoutingTreeNode {
    let address = std::mem::take(&mut arena[id].0);
    let child_ids = std::mem::take(&mut arena[id].1);
    let mut node = RoutingTreeNode::leaf(address);
    node.children = child_ids.into_iter().map(|c| assemble(arena, c)).collect();
    node
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
