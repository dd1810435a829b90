use crate::{
    config::Config,
    error::SequencingError,
    graph::DependencyGraph,
    types::{HashMap, HashSet, NodeId},
};
use derive_more::Deref;
use tracing::{debug, warn};

/// Dependencies-first sequence of nodes.
#[derive(Debug, Deref, Clone, Default, PartialEq, Eq)]
pub struct EvalOrder(Vec<NodeId>);

impl EvalOrder {
    pub(crate) fn new(nodes: Vec<NodeId>) -> Self {
        Self(nodes)
    }

    /// The nodes, in evaluation order.
    #[must_use]
    pub fn as_slice(&self) -> &[NodeId] {
        &self.0
    }
}

/// Builds and caches evaluation orders.
///
/// The global order (key `None`) covers every root. The order of a specific
/// root is the global order filtered to the root's dependencies, so any two
/// roots agree on the relative order of what they share. Building and reading
/// are separate so callers can force a rebuild after editing the graph.
#[derive(Debug, Default, Clone)]
pub struct OrderBuilder {
    orders: HashMap<Option<NodeId>, EvalOrder>,
}

impl OrderBuilder {
    /// Empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build (or rebuild) and cache the order for `root`, `None` meaning the
    /// global order over every root of `graph`.
    ///
    /// Rebuilding a cached order is legal but logged, as it usually means
    /// redundant work upstream.
    ///
    /// # Errors
    /// - [`SequencingError::GlobalOrderNotBuilt`] if `root` is given before the
    ///   global order exists.
    /// - [`SequencingError::OutsideGlobalOrder`] if `root` or one of its
    ///   dependencies is not part of the global order.
    pub fn build_order<C: Config>(
        &mut self,
        graph: &DependencyGraph<'_, C>,
        root: Option<NodeId>,
    ) -> Result<&EvalOrder, SequencingError> {
        if self.orders.contains_key(&root) {
            match root {
                Some(root) => warn!(root = %graph.name(root), "evaluation order built twice"),
                None => warn!("global evaluation order built twice"),
            }
        }
        let order = match root {
            None => EvalOrder(graph.post_order(graph.roots())),
            Some(root) => {
                // Only the membership of the raw traversal matters; the
                // sequence comes from the global order, which must cover it.
                let global = self
                    .orders
                    .get(&None)
                    .ok_or(SequencingError::GlobalOrderNotBuilt)?;
                let covered: HashSet<NodeId> = global.iter().copied().collect();
                let raw = graph.post_order(&[root]);
                if let Some(&missing) = raw.iter().rev().find(|node| !covered.contains(node)) {
                    return Err(SequencingError::OutsideGlobalOrder {
                        root: graph.name(root),
                        node: graph.name(missing),
                    });
                }
                let members: HashSet<NodeId> = raw.into_iter().collect();
                EvalOrder(
                    global
                        .iter()
                        .copied()
                        .filter(|node| members.contains(node))
                        .collect(),
                )
            }
        };
        debug!(
            root = %root.map_or_else(|| "<global>".to_owned(), |r| graph.name(r)),
            len = order.len(),
            "built evaluation order"
        );
        self.orders.insert(root, order);
        Ok(&self.orders[&root])
    }

    /// Cached order for `root`.
    ///
    /// # Errors
    /// [`SequencingError::OrderNotBuilt`] naming the root if
    /// [`Self::build_order`] was never called for it.
    pub fn order<C: Config>(
        &self,
        graph: &DependencyGraph<'_, C>,
        root: Option<NodeId>,
    ) -> Result<&EvalOrder, SequencingError> {
        self.orders.get(&root).ok_or_else(|| match root {
            Some(root) => SequencingError::OrderNotBuilt {
                root: graph.name(root),
            },
            None => SequencingError::GlobalOrderNotBuilt,
        })
    }

    /// Whether an order for `root` is cached.
    #[must_use]
    pub fn exists(&self, root: Option<NodeId>) -> bool {
        self.orders.contains_key(&root)
    }

    /// `nodes` ordered consistently with the global order. A filter over the
    /// global order rather than a fresh sort, so the result always agrees with
    /// every cached per-root order. Duplicates collapse.
    ///
    /// # Errors
    /// [`SequencingError::GlobalOrderNotBuilt`].
    pub fn sort_by_global_order(
        &self,
        nodes: impl IntoIterator<Item = NodeId>,
    ) -> Result<Vec<NodeId>, SequencingError> {
        let wanted: HashSet<NodeId> = nodes.into_iter().collect();
        let global = self
            .orders
            .get(&None)
            .ok_or(SequencingError::GlobalOrderNotBuilt)?;
        Ok(global
            .iter()
            .copied()
            .filter(|node| wanted.contains(node))
            .collect())
    }

    /// Replace the cached global order with a re-grouped version of itself
    /// (same nodes, loops made contiguous).
    ///
    /// # Panics
    /// If there is no global order yet or `order` is not a permutation of it.
    pub(crate) fn replace_global(&mut self, order: EvalOrder) {
        let current = self.orders.get_mut(&None).expect("OrderBuilder::replace_global: [1]");
        assert_eq!(current.len(), order.len(), "OrderBuilder::replace_global: [2]");
        *current = order;
    }

    /// Drop the cached order of `root`.
    pub fn invalidate(&mut self, root: Option<NodeId>) {
        self.orders.remove(&root);
    }

    /// Drop every cached order.
    pub fn clear(&mut self) {
        self.orders.clear();
    }
}
