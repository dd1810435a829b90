use super::Network;
use crate::{
    config::Config,
    error::{ConfigError, Result},
    node::{Node, NodeGroup, NodeSpec},
    pool::BufferPool,
    types::NodeId,
};
use tracing::debug;

impl<C: Config> Network<C> {
    /// Add a node built from `spec`. Its inputs must already exist; cycles
    /// are closed afterwards with [`Self::set_inputs`].
    ///
    /// # Errors
    /// - [`ConfigError::DuplicateName`].
    /// - [`ConfigError::DanglingInput`] for an input that is not a live node.
    pub fn add_node(&mut self, spec: NodeSpec<C>) -> Result<NodeId> {
        if self.nodes.contains_name(&spec.name) {
            return Err(ConfigError::DuplicateName { name: spec.name }.into());
        }
        if let Some(&input) = spec.inputs.iter().find(|&&input| !self.nodes.contains(input)) {
            return Err(ConfigError::DanglingInput {
                name: spec.name,
                input,
            }
            .into());
        }
        let id = self.nodes.next_id();
        let node = Node::from_spec(id, spec, self.options.default_device);
        debug!(node = %node.name, %id, operation = node.operation(), "added node");
        self.nodes.insert(node);
        self.slots.grow(self.nodes.capacity());
        self.invalidate();
        Ok(id)
    }

    /// Rewire the inputs of `id`, in kernel argument order.
    ///
    /// # Errors
    /// - [`ConfigError::UnknownNode`].
    /// - [`ConfigError::DanglingInput`] for an input that is not a live node.
    pub fn set_inputs(&mut self, id: NodeId, inputs: &[NodeId]) -> Result<()> {
        let name = self.require(id)?.name.clone();
        if let Some(&input) = inputs.iter().find(|&&input| !self.nodes.contains(input)) {
            return Err(ConfigError::DanglingInput { name, input }.into());
        }
        self.node_entry(id).inputs = inputs.to_vec();
        self.invalidate();
        Ok(())
    }

    /// Tag `id` with `group`. Output-side groups make the node a root.
    ///
    /// # Errors
    /// [`ConfigError::UnknownNode`].
    pub fn tag(&mut self, id: NodeId, group: NodeGroup) -> Result<()> {
        self.require(id)?;
        if self.node_entry(id).groups.insert(group) {
            self.invalidate();
        }
        Ok(())
    }

    /// Make `id` an evaluation target even though other nodes consume it.
    ///
    /// # Errors
    /// [`ConfigError::MissingRoot`].
    pub fn add_root(&mut self, id: NodeId) -> Result<()> {
        if !self.nodes.contains(id) {
            return Err(ConfigError::MissingRoot { id }.into());
        }
        if self.explicit_roots.insert(id) {
            self.invalidate();
        }
        Ok(())
    }

    /// Give `id` a new unique name. The handle is unchanged.
    ///
    /// # Errors
    /// - [`ConfigError::UnknownNode`].
    /// - [`ConfigError::DuplicateName`].
    pub fn rename_node(&mut self, id: NodeId, new_name: impl Into<String>) -> Result<()> {
        let new_name = new_name.into();
        if self.require(id)?.name == new_name {
            return Ok(());
        }
        if self.nodes.contains_name(&new_name) {
            return Err(ConfigError::DuplicateName { name: new_name }.into());
        }
        self.nodes.rename(id, new_name);
        // Loop and plan names derive from node names.
        self.invalidate();
        Ok(())
    }

    /// Swap node `id` for a new node built from `spec`, which may reuse the old
    /// name. Consumers and root status move to the new node, which also
    /// inherits the old group tags. The old handle becomes unknown.
    ///
    /// # Errors
    /// - [`ConfigError::UnknownNode`].
    /// - [`ConfigError::DuplicateName`] if `spec` takes another node's name.
    /// - [`ConfigError::DanglingInput`] for an input that is not a live node
    ///   (the old node included).
    pub fn replace_node(&mut self, id: NodeId, mut spec: NodeSpec<C>) -> Result<NodeId> {
        let old_name = self.require(id)?.name.clone();
        if spec.name != old_name && self.nodes.contains_name(&spec.name) {
            return Err(ConfigError::DuplicateName { name: spec.name }.into());
        }
        if let Some(&input) = spec
            .inputs
            .iter()
            .find(|&&input| input == id || !self.nodes.contains(input))
        {
            return Err(ConfigError::DanglingInput {
                name: spec.name,
                input,
            }
            .into());
        }

        let old = self.nodes.remove(id).expect("Network::replace_node: [1]");
        self.release_buffers_of(id);
        for group in old.groups.iter() {
            spec.groups.insert(group);
        }
        let new_id = self.nodes.next_id();
        let node = Node::from_spec(new_id, spec, self.options.default_device);
        debug!(old = %old_name, new = %node.name, from = %id, to = %new_id, "replaced node");
        self.nodes.insert(node);
        for consumer in self.nodes.iter_mut() {
            for input in &mut consumer.inputs {
                if *input == id {
                    *input = new_id;
                }
            }
        }
        if self.explicit_roots.shift_remove(&id) {
            self.explicit_roots.insert(new_id);
        }
        self.slots.grow(self.nodes.capacity());
        self.invalidate();
        Ok(new_id)
    }

    /// Remove `id`, returning its buffers to the pool.
    ///
    /// # Errors
    /// - [`ConfigError::UnknownNode`].
    /// - [`ConfigError::NodeInUse`] while another node consumes it.
    pub fn delete_node(&mut self, id: NodeId) -> Result<()> {
        let name = self.require(id)?.name.clone();
        let consumers: Vec<String> = self
            .consumers_of(id)
            .into_iter()
            .filter(|&consumer| consumer != id)
            .map(|consumer| self.nodes.display_name(consumer))
            .collect();
        if !consumers.is_empty() {
            return Err(ConfigError::NodeInUse { name, consumers }.into());
        }
        self.nodes.remove(id);
        self.release_buffers_of(id);
        self.explicit_roots.shift_remove(&id);
        self.dirty_inputs.shift_remove(&id);
        debug!(node = %name, %id, "deleted node");
        self.invalidate();
        Ok(())
    }

    /// An independent copy for concurrent evaluation: same nodes, values,
    /// orders and plans, its own empty buffer pool, and the same clock so
    /// timestamps stay comparable across copies.
    #[must_use]
    pub fn fork(&self) -> Self
    where
        C::Kernel: Clone,
        C::Buffer: Clone,
    {
        Self {
            nodes: self.nodes.clone(),
            slots: self.slots.clone(),
            pool: BufferPool::new(),
            options: self.options.clone(),
            clock: self.clock.clone(),
            layout: self.layout,
            explicit_roots: self.explicit_roots.clone(),
            roots: self.roots.clone(),
            orders: self.orders.clone(),
            loops: self.loops.clone(),
            compiled: self.compiled.clone(),
            structure_version: self.structure_version,
            dirty_inputs: self.dirty_inputs.clone(),
        }
    }

    fn node_entry(&mut self, id: NodeId) -> &mut Node<C> {
        self.nodes.get_mut(id).expect("Network::node_entry: [1]")
    }

    fn release_buffers_of(&mut self, id: NodeId) {
        let (value, gradient) = self.slots.take(id);
        for buffer in value.into_iter().chain(gradient) {
            self.pool.release(buffer);
        }
    }

    /// Drop everything derived from the structure.
    fn invalidate(&mut self) {
        self.structure_version += 1;
        self.compiled = None;
        self.orders.clear();
        self.loops.invalidate();
        self.roots.clear();
    }
}
