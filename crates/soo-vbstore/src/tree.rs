//! Node arena
//!
//! Nodes live in a slot vector. A node stores its parent id and the ids of
//! its children in creation order; removing a subtree frees its slots and
//! bumps their generation so stale [`NodeId`]s stop resolving.
//!
//! ```text
//!   slots: [0:/ gen0] [1:backend gen0] [2:device gen0] [3:<free> gen1] ...
//!            │  children=[1,2]
//!            └─ parent=None
//! ```

use crate::path::{components, join_path};
use crate::types::{NodeId, WatchHandle};

pub(crate) struct Node {
    pub(crate) key: String,
    pub(crate) value: Option<String>,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    /// Attached listeners in registration order
    pub(crate) watchers: Vec<WatchHandle>,
}

impl Node {
    fn new(key: &str, value: Option<String>, parent: Option<NodeId>) -> Self {
        Self {
            key: key.to_string(),
            value,
            parent,
            children: Vec::new(),
            watchers: Vec::new(),
        }
    }
}

struct Slot {
    generation: u32,
    node: Option<Node>,
}

pub(crate) struct Tree {
    slots: Vec<Slot>,
    free: Vec<u32>,
    root: NodeId,
    live: usize,
}

impl Tree {
    pub(crate) fn new() -> Self {
        Self {
            slots: vec![Slot {
                generation: 0,
                node: Some(Node::new("", None, None)),
            }],
            free: Vec::new(),
            root: NodeId {
                index: 0,
                generation: 0,
            },
            live: 1,
        }
    }

    pub(crate) fn root(&self) -> NodeId {
        self.root
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }

    pub(crate) fn get(&self, id: NodeId) -> Option<&Node> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.node.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.node.as_mut())
    }

    pub(crate) fn child(&self, parent: NodeId, key: &str) -> Option<NodeId> {
        let node = self.get(parent)?;
        node.children
            .iter()
            .copied()
            .find(|c| self.get(*c).is_some_and(|n| n.key == key))
    }

    /// Resolve a normalized path
    pub(crate) fn lookup(&self, path: &str) -> Option<NodeId> {
        let mut cursor = self.root;
        for component in components(path) {
            cursor = self.child(cursor, component)?;
        }
        Some(cursor)
    }

    /// Append a child to `parent`. The caller has checked that no child
    /// named `key` exists.
    pub(crate) fn insert(&mut self, parent: NodeId, key: &str, value: Option<String>) -> Option<NodeId> {
        self.get(parent)?;
        let node = Node::new(key, value, Some(parent));
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(node);
                NodeId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                NodeId {
                    index,
                    generation: 0,
                }
            }
        };
        if let Some(p) = self.get_mut(parent) {
            p.children.push(id);
        }
        self.live += 1;
        Some(id)
    }

    /// Remove `id` and its whole subtree. Watchers attached anywhere in the
    /// subtree go with it. Returns the number of nodes freed.
    pub(crate) fn remove(&mut self, id: NodeId) -> usize {
        if id == self.root {
            return 0;
        }
        let Some(parent) = self.get(id).and_then(|n| n.parent) else {
            return 0;
        };
        if let Some(p) = self.get_mut(parent) {
            p.children.retain(|c| *c != id);
        }

        let mut stack = vec![id];
        let mut freed = 0;
        while let Some(next) = stack.pop() {
            let Some(slot) = self.slots.get_mut(next.index as usize) else {
                continue;
            };
            if slot.generation != next.generation {
                continue;
            }
            if let Some(node) = slot.node.take() {
                stack.extend(node.children);
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(next.index);
                freed += 1;
            }
        }
        self.live -= freed;
        freed
    }

    /// Absolute path of a live node
    pub(crate) fn path_of(&self, id: NodeId) -> Option<String> {
        let mut keys = Vec::new();
        let mut cursor = id;
        loop {
            let node = self.get(cursor)?;
            match node.parent {
                Some(parent) => {
                    keys.push(node.key.as_str());
                    cursor = parent;
                }
                None => break,
            }
        }
        let mut path = String::from("/");
        for key in keys.iter().rev() {
            path = join_path(&path, key);
        }
        Some(path)
    }

    /// Every live node with at least one watcher
    pub(crate) fn watched_nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.node.as_ref().filter(|n| !n.watchers.is_empty()).map(|n| {
                (
                    NodeId {
                        index: i as u32,
                        generation: s.generation,
                    },
                    n,
                )
            })
        })
    }

    pub(crate) fn watched_nodes_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.slots
            .iter_mut()
            .filter_map(|s| s.node.as_mut())
            .filter(|n| !n.watchers.is_empty())
    }

    /// Structural problems, empty when the tree is sound: a single root,
    /// parent and child links agree, every live node reachable from the root
    pub(crate) fn check(&self) -> Vec<String> {
        let mut problems = Vec::new();

        match self.get(self.root) {
            Some(root) if root.parent.is_none() => {}
            _ => problems.push("root missing or has a parent".to_string()),
        }

        let mut reachable = 0usize;
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let Some(node) = self.get(id) else {
                problems.push(format!("dangling child id {:?}", id));
                continue;
            };
            reachable += 1;
            if reachable > self.slots.len() {
                problems.push("cycle in tree".to_string());
                break;
            }
            let mut seen: Vec<&str> = Vec::new();
            for child in &node.children {
                match self.get(*child) {
                    Some(c) if c.parent == Some(id) => {
                        if seen.contains(&c.key.as_str()) {
                            problems.push(format!("duplicate child {:?} under {:?}", c.key, id));
                        }
                        seen.push(&c.key);
                    }
                    Some(c) => problems.push(format!(
                        "child {:?} of {:?} points at parent {:?}",
                        child, id, c.parent
                    )),
                    None => {}
                }
                stack.push(*child);
            }
        }

        let orphans = self
            .slots
            .iter()
            .enumerate()
            .filter(|(i, s)| s.node.as_ref().is_some_and(|n| n.parent.is_none()) && *i != self.root.index as usize)
            .count();
        if orphans > 0 {
            problems.push(format!("{orphans} parentless nodes besides the root"));
        }
        if reachable != self.live {
            problems.push(format!(
                "{} nodes reachable from the root, {} live",
                reachable, self.live
            ));
        }
        problems
    }
}
