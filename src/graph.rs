use crate::{
    config::Config,
    node::{Node, NodeArena},
    types::NodeId,
};

/// Read-only adjacency view over a network: a root set plus the predecessor
/// (input) function. Owns nothing.
pub struct DependencyGraph<'a, C: Config> {
    nodes: &'a NodeArena<C>,
    roots: &'a [NodeId],
}

impl<'a, C: Config> DependencyGraph<'a, C> {
    pub(crate) fn new(nodes: &'a NodeArena<C>, roots: &'a [NodeId]) -> Self {
        Self { nodes, roots }
    }

    /// Declared roots.
    #[must_use]
    pub fn roots(&self) -> &'a [NodeId] {
        self.roots
    }

    /// Inputs of `node`; empty for unknown handles.
    #[must_use]
    pub fn predecessors(&self, node: NodeId) -> &'a [NodeId] {
        self.nodes
            .get(node)
            .map(|n| n.inputs.as_slice())
            .unwrap_or_default()
    }

    /// The node behind a handle.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&'a Node<C>> {
        self.nodes.get(id)
    }

    /// Name of `id` for diagnostics.
    #[must_use]
    pub fn name(&self, id: NodeId) -> String {
        self.nodes.display_name(id)
    }

    /// Every live node, in creation order, reachable or not.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + 'a {
        self.nodes.iter().map(|node| node.id)
    }

    /// Upper bound (exclusive) of every live handle's index.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.nodes.capacity()
    }

    /// Depth-first post-order over `starts` and everything they transitively
    /// depend on: each node appears once, after all of its inputs that were not
    /// already on the traversal stack. On an acyclic graph that is a valid
    /// dependencies-first order.
    ///
    /// Iterative, so deep networks don't exhaust the call stack.
    #[must_use]
    pub fn post_order(&self, starts: &[NodeId]) -> Vec<NodeId> {
        let mut visited = vec![false; self.capacity()];
        let mut order = Vec::new();
        // (node, index of the next input to descend into)
        let mut stack: Vec<(NodeId, usize)> = Vec::new();
        for &start in starts {
            if !self.nodes.contains(start) || visited[start.index()] {
                continue;
            }
            visited[start.index()] = true;
            stack.push((start, 0));
            while let Some(&(node, next_input)) = stack.last() {
                let inputs = self.predecessors(node);
                if let Some(&input) = inputs.get(next_input) {
                    stack.last_mut().expect("DependencyGraph::post_order: [1]").1 += 1;
                    if self.nodes.contains(input) && !visited[input.index()] {
                        visited[input.index()] = true;
                        stack.push((input, 0));
                    }
                } else {
                    stack.pop();
                    order.push(node);
                }
            }
        }
        order
    }
}
