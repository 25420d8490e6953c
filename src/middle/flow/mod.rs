//! The flow graph shared by the middle passes. A component owns arenas of
//! nodes, edges, blocks, functions and leaves; everything refers to
//! everything else by index so the graph can be rewritten in place without
//! fighting cycles. Nothing is ever freed: rewritten entries are marked
//! deleted and dropped with the component.
//!
//! An edge carries both control and the value of the node(s) producing it.
//! Inside a block an edge has exactly one producer and one consumer. An edge
//! that starts a block is fed by the last node of every predecessor block.

use crate::{
    backend::templates::TemplateId,
    index::{IndexVec, simple_index},
    intern::InternedSymbol,
    middle::{
        ctype::{CType, ValuesType},
        policy::Policy,
    },
};

pub mod build;
pub mod edit;
pub mod pretty_print;

simple_index! {
    /// Identifies one operation in a component
    pub struct NodeId;
}

simple_index! {
    /// Identifies an edge (continuation) in a component
    pub struct EdgeId;
}

simple_index! {
    /// Identifies a basic block in a component
    pub struct BlockId;
}

simple_index! {
    pub struct FunctionId;
}

simple_index! {
    /// Identifies any value source a `Ref` node can read
    pub struct LeafId;
}

simple_index! {
    pub struct DispatchId;
}

simple_index! {
    pub struct TailSetId;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: NodeKind,
    /// Where control and the node's value go next
    pub output: EdgeId,
    pub block: BlockId,
    pub policy: Policy,
    /// Type of the value(s) this node delivers
    pub derived: ValuesType,
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Start of a function. Parameters are bound to the arguments of the
    /// calls that reach the entry block, or to the values of `values` when
    /// the binding receives multiple values directly.
    Bind {
        function: FunctionId,
        values: Option<EdgeId>,
    },
    Ref {
        leaf: LeafId,
    },
    Call(Call),
    If {
        test: EdgeId,
        consequent: BlockId,
        alternative: BlockId,
    },
    Set {
        variable: LeafId,
        value: EdgeId,
    },
    Return {
        function: FunctionId,
        result: EdgeId,
    },
    /// Stands in for code that is proven to fail: it signals an error when
    /// reached
    ErrorStub {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub kind: CallKind,
    pub callee: EdgeId,
    /// `None` marks an argument dropped because its parameter is never read
    pub args: Vec<Option<EdgeId>>,
    /// Set when the call's value goes straight to its function's return
    pub tail: bool,
    pub template: Option<TemplateId>,
    /// The call only feeds a branch and compiles to compare-and-branch
    pub fused_branch: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    /// Generic calling convention through the callee's value
    Full,
    /// A call to a function the back end has templates for
    Known(InternedSymbol),
    /// Direct call to a function in the same component
    Local,
    /// Binding site of a function merged into its caller. The arguments
    /// flow straight into the merged entry, so nothing is called here.
    Let,
    /// Self tail call of an assignment-converted function: rebinds the
    /// parameters and jumps to the entry
    Assignment,
    /// Known to fail (bad argument count or keywords). Never compiled.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// Not wired to a consumer or block yet
    Unused,
    InsideBlock,
    BlockStart,
    Deleted,
}

/// How an asserted type on an edge will be enforced
#[derive(Debug, Clone, PartialEq)]
pub enum TypeCheck {
    /// Nothing to check
    None,
    /// Asserted but not examined yet
    Pending,
    /// The back end tests the value with a check template while generating
    /// the consumer
    Simple {
        types: Vec<CType>,
        templates: Vec<Option<TemplateId>>,
    },
    /// An explicit test was spliced in front of the consumer
    Resolved,
    /// Not checked: the consumer does not need it or the check is not
    /// feasible
    Dropped,
    /// The value can never satisfy the assertion
    Error,
}

/// How the value of an edge is delivered to its consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Convention {
    /// A single materialized value
    FixedOne,
    /// A statically known number of values
    Fixed(usize),
    /// A runtime count, pushed and popped around block boundaries
    Unknown,
    /// Not materialized: the consumer reads the producer's source directly
    Delayed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub kind: EdgeKind,
    pub producers: Vec<NodeId>,
    pub consumer: Option<NodeId>,
    /// The block this edge starts, if any
    pub block: Option<BlockId>,
    pub asserted: ValuesType,
    pub derived: ValuesType,
    pub check: TypeCheck,
    pub convention: Option<Convention>,
}

impl Edge {
    pub fn new() -> Self {
        Self {
            kind: EdgeKind::Unused,
            producers: Vec::new(),
            consumer: None,
            block: None,
            asserted: ValuesType::wild(),
            derived: ValuesType::wild(),
            check: TypeCheck::None,
            convention: None,
        }
    }

    pub fn starts_block(&self) -> bool {
        self.kind == EdgeKind::BlockStart
    }
}

impl Default for Edge {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Block {
    pub nodes: Vec<NodeId>,
    pub start: Option<EdgeId>,
    pub predecessors: Vec<BlockId>,
    pub successors: Vec<BlockId>,
    /// Home function. Blocks of merged functions belong to the function
    /// they were merged into. `None` for the component's sentinels.
    pub function: Option<FunctionId>,
    pub deleted: bool,
    /// Unknown-count values left on the stack when the block ends
    pub pushed: Vec<EdgeId>,
    /// Unknown-count values taken off the stack inside the block
    pub popped: Vec<EdgeId>,
}

impl Block {
    pub fn last(&self) -> Option<NodeId> {
        self.nodes.last().copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionKind {
    Plain,
    /// Merged into the caller at its only call site
    Let,
    /// Merged into the caller with self tail calls turned into jumps
    Assignment,
    /// Entry point of a function with optional or keyword parameters
    Optional,
    /// Generic calling convention wrapper
    External,
    /// Inline function generated to hold a spliced type check
    Cleanup,
    Deleted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: InternedSymbol,
    pub kind: FunctionKind,
    /// Variable leaves bound by the entry node
    pub params: Vec<LeafId>,
    pub bind: NodeId,
    pub entry: BlockId,
    pub return_node: Option<NodeId>,
    pub tail_set: Option<TailSetId>,
    /// The leaf that references this function
    pub leaf: LeafId,
    /// Function this one was merged into
    pub home: Option<FunctionId>,
    /// Functions merged into this one
    pub lets: Vec<FunctionId>,
    /// Functions this one calls locally
    pub calls: Vec<FunctionId>,
    pub external_entry: Option<FunctionId>,
    /// For entry points: the dispatch they belong to
    pub dispatch: Option<DispatchId>,
    /// Referenced from outside the component by name
    pub exported: bool,
}

impl FunctionDef {
    pub fn is_live(&self) -> bool {
        self.kind != FunctionKind::Deleted
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Integer(i64),
    Float(f64),
    Character(char),
    Symbol(InternedSymbol),
    Null,
    String(String),
    /// A type specifier, used as the argument of type tests
    Type(CType),
}

impl Constant {
    pub fn ty(&self) -> CType {
        match self {
            Constant::Integer(value) => CType::int_range(Some(*value), Some(*value)),
            Constant::Float(_) => CType::float(),
            Constant::Character(_) => CType::character(),
            Constant::Symbol(_) | Constant::Type(_) => CType::symbol(),
            Constant::Null => CType::null(),
            Constant::String(_) => CType::string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LeafKind {
    Function(FunctionId),
    /// A function with optional or keyword parameters, reached through its
    /// entry points
    Dispatch(DispatchId),
    Variable {
        name: InternedSymbol,
        home: FunctionId,
        sets: Vec<NodeId>,
    },
    /// A named function outside the component
    Global(InternedSymbol),
    Constant(Constant),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Leaf {
    pub kind: LeafKind,
    pub ty: CType,
    pub refs: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyParam {
    pub keyword: InternedSymbol,
    pub default: Constant,
}

/// Entry points of a function with optional and keyword parameters. A call
/// with `min_args + i` arguments goes to `entry_points[i]`; the main entry
/// takes every positional parameter followed by one value per keyword.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub name: InternedSymbol,
    pub leaf: LeafId,
    pub min_args: usize,
    pub max_args: usize,
    pub entry_points: Vec<FunctionId>,
    pub main_entry: FunctionId,
    pub keys: Vec<KeyParam>,
    pub allow_other_keys: bool,
    pub external_entry: Option<FunctionId>,
    pub exported: bool,
}

/// Functions whose return types are inferred together because one may tail
/// call another. Sets only ever grow; a merged set forwards to the one it
/// was merged into.
#[derive(Debug, Clone, PartialEq)]
pub struct TailSet {
    pub functions: Vec<FunctionId>,
    pub return_type: ValuesType,
    pub merged_into: Option<TailSetId>,
}

/// One unit of mutually referencing functions, processed as a whole by
/// every pass
#[derive(Debug, Clone)]
pub struct Component {
    pub name: InternedSymbol,
    pub nodes: IndexVec<NodeId, Node>,
    pub edges: IndexVec<EdgeId, Edge>,
    pub blocks: IndexVec<BlockId, Block>,
    pub functions: IndexVec<FunctionId, FunctionDef>,
    pub leaves: IndexVec<LeafId, Leaf>,
    pub dispatches: IndexVec<DispatchId, Dispatch>,
    pub tail_sets: IndexVec<TailSetId, TailSet>,
    /// Sentinel preceding every function entry
    pub head: BlockId,
    /// Sentinel following every return and every block that never returns
    pub tail: BlockId,
    /// Functions whose references changed and should be looked at again
    pub reanalyze: Vec<FunctionId>,
}

impl Component {
    pub fn new(name: &str) -> Self {
        let mut blocks = IndexVec::new();
        let head = blocks.push(Block::default());
        let tail = blocks.push(Block::default());

        Self {
            name: InternedSymbol::new(name),
            nodes: IndexVec::new(),
            edges: IndexVec::new(),
            blocks,
            functions: IndexVec::new(),
            leaves: IndexVec::new(),
            dispatches: IndexVec::new(),
            tail_sets: IndexVec::new(),
            head,
            tail,
            reanalyze: Vec::new(),
        }
    }

    pub fn call(&self, node: NodeId) -> Option<&Call> {
        match &self.nodes[node].kind {
            NodeKind::Call(call) => Some(call),
            _ => None,
        }
    }

    pub fn call_mut(&mut self, node: NodeId) -> Option<&mut Call> {
        match &mut self.nodes[node].kind {
            NodeKind::Call(call) => Some(call),
            _ => None,
        }
    }

    /// Function the node's code belongs to after merging
    pub fn home(&self, node: NodeId) -> Option<FunctionId> {
        self.blocks[self.nodes[node].block].function
    }

    pub fn function_by_name(&self, name: &str) -> Option<FunctionId> {
        self.functions
            .enumerate()
            .find(|(_, f)| f.is_live() && f.name.value() == name)
            .map(|(id, _)| id)
    }

    pub fn dispatch_by_name(&self, name: &str) -> Option<DispatchId> {
        self.dispatches
            .enumerate()
            .find(|(_, d)| d.name.value() == name)
            .map(|(id, _)| id)
    }

    /// The leaf a `Ref` node reads
    pub fn ref_leaf(&self, node: NodeId) -> Option<LeafId> {
        match self.nodes[node].kind {
            NodeKind::Ref { leaf } => Some(leaf),
            _ => None,
        }
    }

    /// The single node producing the edge, if there is exactly one
    pub fn sole_producer(&self, edge: EdgeId) -> Option<NodeId> {
        match self.edges[edge].producers.as_slice() {
            [node] => Some(*node),
            _ => None,
        }
    }

    /// Name a call goes to, when its callee is a direct reference
    pub fn callee_name(&self, call: &Call) -> Option<InternedSymbol> {
        let leaf = self.ref_leaf(self.sole_producer(call.callee)?)?;

        match &self.leaves[leaf].kind {
            LeafKind::Function(function) => Some(self.functions[*function].name),
            LeafKind::Dispatch(dispatch) => Some(self.dispatches[*dispatch].name),
            LeafKind::Global(name) => Some(*name),
            _ => None,
        }
    }

    /// Edge carrying the value returned by the function
    pub fn return_result(&self, function: FunctionId) -> Option<EdgeId> {
        let node = self.functions[function].return_node?;

        match self.nodes[node].kind {
            NodeKind::Return { result, .. } => Some(result),
            _ => None,
        }
    }

    /// Follows merged tail sets to the one that is still current
    pub fn tail_set(&self, function: FunctionId) -> Option<TailSetId> {
        let mut set = self.functions[function].tail_set?;

        while let Some(next) = self.tail_sets[set].merged_into {
            set = next;
        }

        Some(set)
    }

    pub fn live_blocks(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks
            .enumerate()
            .filter(|(id, b)| !b.deleted && *id != self.head && *id != self.tail)
            .map(|(id, _)| id)
    }

    pub fn live_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.live_blocks()
            .flat_map(|b| self.blocks[b].nodes.iter().copied())
            .filter(|n| !self.nodes[*n].deleted)
    }

    pub fn live_functions(&self) -> impl Iterator<Item = FunctionId> + '_ {
        self.functions
            .enumerate()
            .filter(|(_, f)| f.is_live())
            .map(|(id, _)| id)
    }

    /// Recomputes an edge's derived type from its producers
    pub fn rederive(&mut self, edge: EdgeId) -> ValuesType {
        let derived = self.edges[edge]
            .producers
            .iter()
            .map(|n| self.nodes[*n].derived.clone())
            .reduce(|a, b| a.union(&b))
            .unwrap_or_else(ValuesType::wild);

        self.edges[edge].derived = derived.clone();
        derived
    }

    /// Checks the structural invariants every pass preserves. Returns a
    /// description of each violation.
    pub fn verify(&self) -> Vec<String> {
        let mut problems = Vec::new();

        for (id, edge) in self.edges.enumerate() {
            if edge.kind == EdgeKind::InsideBlock && edge.producers.len() > 1 {
                problems.push(format!("{id:?} is inside a block but has several producers"));
            }

            for producer in &edge.producers {
                if self.nodes[*producer].output != id {
                    problems.push(format!("{producer:?} is listed as a producer of {id:?}"));
                }
            }

            if let Some(block) = edge.block {
                if edge.kind == EdgeKind::BlockStart && self.blocks[block].start != Some(id) {
                    problems.push(format!("{id:?} claims to start {block:?}"));
                }
            }
        }

        for block in self.live_blocks() {
            let data = &self.blocks[block];

            for succ in &data.successors {
                if !self.blocks[*succ].predecessors.contains(&block) {
                    problems.push(format!("{block:?} -> {succ:?} is missing its back link"));
                }
                if self.blocks[*succ].deleted {
                    problems.push(format!("{block:?} links to deleted {succ:?}"));
                }
            }

            for pred in &data.predecessors {
                if !self.blocks[*pred].successors.contains(&block) {
                    problems.push(format!("{pred:?} -> {block:?} is missing its forward link"));
                }
            }

            for node in &data.nodes {
                if self.nodes[*node].block != block {
                    problems.push(format!("{node:?} is in {block:?} but says otherwise"));
                }
            }

            // A block that falls through hands its last value to the start
            // of its successor
            let Some(last) = data.last() else { continue };
            let falls_through = !matches!(
                self.nodes[last].kind,
                NodeKind::If { .. } | NodeKind::Return { .. }
            );

            for succ in &data.successors {
                if falls_through
                    && *succ != self.tail
                    && self.blocks[*succ].start != Some(self.nodes[last].output)
                {
                    problems.push(format!("{block:?} falls into {succ:?} with the wrong edge"));
                }
            }
        }

        problems
    }
}
