//! Bookkeeping primitives the passes rewrite the graph with. None of these
//! make optimization decisions; they only keep producers, consumers and
//! block links consistent.

use crate::{
    error::{InternalError, Result},
    middle::{
        ctype::ValuesType,
        flow::{
            Block, BlockId, Component, Edge, EdgeId, EdgeKind, FunctionId, LeafId, LeafKind,
            Node, NodeId, NodeKind,
        },
        policy::Policy,
    },
};

impl NodeKind {
    /// Edges this node reads, in evaluation order
    pub fn operands(&self) -> Vec<EdgeId> {
        match self {
            NodeKind::Bind { values, .. } => values.iter().copied().collect(),
            NodeKind::Ref { .. } | NodeKind::ErrorStub { .. } => Vec::new(),
            NodeKind::Call(call) => std::iter::once(call.callee)
                .chain(call.args.iter().flatten().copied())
                .collect(),
            NodeKind::If { test, .. } => vec![*test],
            NodeKind::Set { value, .. } => vec![*value],
            NodeKind::Return { result, .. } => vec![*result],
        }
    }
}

impl Component {
    pub fn new_edge(&mut self) -> EdgeId {
        self.edges.push(Edge::new())
    }

    pub fn new_block(&mut self, function: Option<FunctionId>) -> BlockId {
        self.blocks.push(Block {
            function,
            ..Default::default()
        })
    }

    /// Creates a block that starts with `edge`
    pub fn new_block_at(&mut self, edge: EdgeId, function: Option<FunctionId>) -> BlockId {
        let block = self.new_block(function);

        self.blocks[block].start = Some(edge);
        self.edges[edge].kind = EdgeKind::BlockStart;
        self.edges[edge].block = Some(block);

        block
    }

    pub fn link_blocks(&mut self, from: BlockId, to: BlockId) {
        if !self.blocks[from].successors.contains(&to) {
            self.blocks[from].successors.push(to);
        }

        if !self.blocks[to].predecessors.contains(&from) {
            self.blocks[to].predecessors.push(from);
        }
    }

    pub fn unlink_blocks(&mut self, from: BlockId, to: BlockId) {
        self.blocks[from].successors.retain(|b| *b != to);
        self.blocks[to].predecessors.retain(|b| *b != from);
    }

    /// Adds a node to the end of `block`, registering it as a producer of
    /// `output` and as the consumer of its operands
    pub fn append_node(
        &mut self,
        block: BlockId,
        kind: NodeKind,
        output: EdgeId,
        derived: ValuesType,
        policy: Policy,
    ) -> NodeId {
        let operands = kind.operands();
        let leaf = match &kind {
            NodeKind::Ref { leaf } => Some(*leaf),
            _ => None,
        };
        let set_variable = match &kind {
            NodeKind::Set { variable, .. } => Some(*variable),
            _ => None,
        };

        let node = self.nodes.push(Node {
            kind,
            output,
            block,
            policy,
            derived,
            deleted: false,
        });

        self.blocks[block].nodes.push(node);

        for operand in operands {
            self.edges[operand].consumer = Some(node);
        }

        if let Some(leaf) = leaf {
            self.leaves[leaf].refs.push(node);
        }

        if let Some(variable) = set_variable {
            if let LeafKind::Variable { sets, .. } = &mut self.leaves[variable].kind {
                sets.push(node);
            }
        }

        self.add_producer(output, node);

        node
    }

    pub fn add_producer(&mut self, edge: EdgeId, node: NodeId) {
        let data = &mut self.edges[edge];

        if !data.producers.contains(&node) {
            data.producers.push(node);
        }

        if data.kind == EdgeKind::Unused {
            data.kind = EdgeKind::InsideBlock;
        }
    }

    /// Makes `node` deliver to `edge` instead of its current output
    pub fn set_output(&mut self, node: NodeId, edge: EdgeId) {
        let old = self.nodes[node].output;
        self.edges[old].producers.retain(|n| *n != node);

        self.nodes[node].output = edge;
        self.add_producer(edge, node);
    }

    /// Moves every producer of `from` over to `to`, relinking the blocks
    /// they end so control follows the value. Returns the moved producers.
    pub fn move_producers(&mut self, from: EdgeId, to: EdgeId) -> Vec<NodeId> {
        let producers = std::mem::take(&mut self.edges[from].producers);
        let old_block = self.edges[from].block;
        let new_block = self.edges[to].block;

        for producer in &producers {
            let block = self.nodes[*producer].block;

            if let Some(old_block) = old_block {
                self.unlink_blocks(block, old_block);
            }

            if let Some(new_block) = new_block {
                self.link_blocks(block, new_block);
            }

            self.nodes[*producer].output = to;
            self.add_producer(to, *producer);
        }

        producers
    }

    /// Makes `edge` start a block, splitting the block of its producer right
    /// after it. Every node that read the edge stays where it was, so no use
    /// is dropped or duplicated. Returns the block the edge starts.
    pub fn ensure_block_start(&mut self, edge: EdgeId) -> Result<BlockId> {
        if self.edges[edge].starts_block() {
            if let Some(block) = self.edges[edge].block {
                return Ok(block);
            }
        }

        let producer = self
            .sole_producer(edge)
            .ok_or(InternalError::MissingProducer(edge))?;
        let block = self.nodes[producer].block;

        let position = self.blocks[block]
            .nodes
            .iter()
            .position(|n| *n == producer)
            .ok_or(InternalError::NodeNotInBlock {
                node: producer,
                block,
            })?;

        let function = self.blocks[block].function;
        let rest = self.blocks[block].nodes.split_off(position + 1);
        let successors = std::mem::take(&mut self.blocks[block].successors);

        let new_block = self.new_block_at(edge, function);

        for node in &rest {
            self.nodes[*node].block = new_block;
        }
        self.blocks[new_block].nodes = rest;

        for succ in successors {
            self.blocks[succ].predecessors.retain(|b| *b != block);
            self.link_blocks(new_block, succ);
        }

        self.link_blocks(block, new_block);

        tracing::trace!(?edge, ?block, ?new_block, "split block");

        Ok(new_block)
    }

    /// Removes a node that has no further effect. Its operands lose their
    /// consumer and it stops being a reference to its leaf.
    pub fn delete_node(&mut self, node: NodeId) {
        let block = self.nodes[node].block;
        self.blocks[block].nodes.retain(|n| *n != node);

        for operand in self.nodes[node].kind.operands() {
            if self.edges[operand].consumer == Some(node) {
                self.edges[operand].consumer = None;
            }
        }

        self.forget_leaf_use(node);

        let output = self.nodes[node].output;
        self.edges[output].producers.retain(|n| *n != node);
        self.nodes[node].deleted = true;
    }

    /// Adds a node right before `before` in its block
    pub fn insert_node_before(
        &mut self,
        before: NodeId,
        kind: NodeKind,
        output: EdgeId,
        derived: ValuesType,
        policy: Policy,
    ) -> Result<NodeId> {
        let block = self.nodes[before].block;
        let position = self.blocks[block]
            .nodes
            .iter()
            .position(|n| *n == before)
            .ok_or(InternalError::NodeNotInBlock {
                node: before,
                block,
            })?;

        let node = self.append_node(block, kind, output, derived, policy);

        // `append_node` put it at the end
        self.blocks[block].nodes.pop();
        self.blocks[block].nodes.insert(position, node);

        Ok(node)
    }

    /// Turns a value-producing node into a stub that fails at run time. Its
    /// operands are left without a consumer.
    pub fn replace_with_error_stub(&mut self, node: NodeId, message: String) {
        for operand in self.nodes[node].kind.operands() {
            if self.edges[operand].consumer == Some(node) {
                self.edges[operand].consumer = None;
            }
        }

        self.forget_leaf_use(node);

        let data = &mut self.nodes[node];
        data.kind = NodeKind::ErrorStub { message };
        data.derived = ValuesType::nothing();
    }

    /// Drops an operand that is no longer read. A reference feeding only
    /// this operand is deleted with it.
    pub fn release_operand(&mut self, edge: EdgeId) {
        self.edges[edge].consumer = None;

        if self.edges[edge].kind != EdgeKind::InsideBlock {
            return;
        }

        if let Some(producer) = self.sole_producer(edge) {
            if matches!(self.nodes[producer].kind, NodeKind::Ref { .. }) {
                self.delete_node(producer);
                self.edges[edge].kind = EdgeKind::Deleted;
            }
        }
    }

    /// Drops `node` from the reference or assignment list of its leaf. If
    /// the leaf is a function, the function is queued for another look.
    pub fn forget_leaf_use(&mut self, node: NodeId) {
        let leaf = match &self.nodes[node].kind {
            NodeKind::Ref { leaf } => *leaf,
            NodeKind::Set { variable, .. } => {
                if let LeafKind::Variable { sets, .. } = &mut self.leaves[*variable].kind {
                    sets.retain(|n| *n != node);
                }
                return;
            }
            _ => return,
        };

        self.leaves[leaf].refs.retain(|n| *n != node);
        self.queue_leaf(leaf);
    }

    /// Points a `Ref` node at a different leaf
    pub fn retarget_ref(&mut self, node: NodeId, leaf: LeafId) {
        self.forget_leaf_use(node);

        self.nodes[node].kind = NodeKind::Ref { leaf };
        self.leaves[leaf].refs.push(node);
    }

    pub fn queue_function(&mut self, function: FunctionId) {
        if !self.reanalyze.contains(&function) {
            self.reanalyze.push(function);
        }
    }

    fn queue_leaf(&mut self, leaf: LeafId) {
        match self.leaves[leaf].kind {
            LeafKind::Function(function) => self.queue_function(function),
            LeafKind::Dispatch(dispatch) => {
                let main = self.dispatches[dispatch].main_entry;
                self.queue_function(main);
            }
            _ => {}
        }
    }

    /// Deletes a block: unlinks it from every neighbour and deletes its
    /// nodes
    pub fn delete_block(&mut self, block: BlockId) {
        for succ in self.blocks[block].successors.clone() {
            self.unlink_blocks(block, succ);
        }

        for pred in self.blocks[block].predecessors.clone() {
            self.unlink_blocks(pred, block);
        }

        for node in self.blocks[block].nodes.clone() {
            self.delete_node(node);
        }

        if let Some(start) = self.blocks[block].start {
            if self.edges[start].block == Some(block) {
                self.edges[start].kind = EdgeKind::Deleted;
            }
        }

        self.blocks[block].deleted = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::{
        ctype::CType,
        flow::{Constant, Leaf},
    };

    fn constant(component: &mut Component, value: i64) -> LeafId {
        component.leaves.push(Leaf {
            kind: LeafKind::Constant(Constant::Integer(value)),
            ty: CType::int_range(Some(value), Some(value)),
            refs: Vec::new(),
        })
    }

    #[test]
    fn splitting_keeps_every_use() {
        let mut component = Component::new("split");
        let block = component.new_block(None);
        let after = component.new_block(None);
        component.link_blocks(block, after);

        let leaf = constant(&mut component, 1);
        let first = component.new_edge();
        let second = component.new_edge();

        let policy = Policy::default();
        let producer = component.append_node(
            block,
            NodeKind::Ref { leaf },
            first,
            ValuesType::single(CType::fixnum()),
            policy,
        );
        let consumer = component.append_node(
            block,
            NodeKind::Set {
                variable: leaf,
                value: first,
            },
            second,
            ValuesType::wild(),
            policy,
        );

        let new_block = component.ensure_block_start(first).unwrap();

        assert_eq!(component.blocks[block].nodes, vec![producer]);
        assert_eq!(component.blocks[new_block].nodes, vec![consumer]);
        assert_eq!(component.blocks[block].successors, vec![new_block]);
        assert_eq!(component.blocks[new_block].successors, vec![after]);
        assert_eq!(component.blocks[after].predecessors, vec![new_block]);
        assert_eq!(component.edges[first].consumer, Some(consumer));
        assert!(component.edges[first].starts_block());

        // Splitting again is a no-op
        assert_eq!(component.ensure_block_start(first).unwrap(), new_block);
    }

    #[test]
    fn unlinking_leaves_no_dangling_links() {
        let mut component = Component::new("unlink");
        let a = component.new_block(None);
        let b = component.new_block(None);

        component.link_blocks(a, b);
        component.link_blocks(a, b);
        assert_eq!(component.blocks[b].predecessors, vec![a]);

        component.unlink_blocks(a, b);
        assert!(component.blocks[a].successors.is_empty());
        assert!(component.blocks[b].predecessors.is_empty());
    }

    #[test]
    fn deleting_a_ref_releases_its_leaf() {
        let mut component = Component::new("delete");
        let block = component.new_block(None);
        let leaf = constant(&mut component, 7);
        let edge = component.new_edge();

        let node = component.append_node(
            block,
            NodeKind::Ref { leaf },
            edge,
            ValuesType::single(CType::fixnum()),
            Policy::default(),
        );
        assert_eq!(component.leaves[leaf].refs, vec![node]);

        component.delete_node(node);

        assert!(component.leaves[leaf].refs.is_empty());
        assert!(component.edges[edge].producers.is_empty());
        assert!(component.blocks[block].nodes.is_empty());
    }
}
