//! Turns small expression trees into flow graphs. This is the stand-in for
//! the front end: it wires producers and consumers, asserts declared types
//! on edges and fills in provisional derived types. The passes use the same
//! converter to generate the code they splice in.

use hashbrown::HashMap;

use crate::{
    backend::templates::TemplateRegistry,
    error::{InternalError, Result},
    intern::InternedSymbol,
    middle::{
        ctype::{CType, ValuesType},
        flow::{
            BlockId, Call, CallKind, Component, Constant, Dispatch, EdgeId, FunctionDef,
            FunctionId, FunctionKind, KeyParam, Leaf, LeafId, LeafKind, NodeKind, TailSet,
            TypeCheck,
        },
        policy::Policy,
    },
};

/// An expression in the input language
#[derive(Debug, Clone, PartialEq)]
pub enum Form {
    Constant(Constant),
    Var(String),
    /// The function named, as a value
    Function(String),
    /// An existing leaf of the component
    Leaf(LeafId),
    Call {
        callee: Box<Form>,
        args: Vec<Form>,
    },
    If(Box<Form>, Box<Form>, Box<Form>),
    Progn(Vec<Form>),
    Set(String, Box<Form>),
    /// Asserts the type of the value
    The(CType, Box<Form>),
}

impl Form {
    pub fn int(value: i64) -> Self {
        Form::Constant(Constant::Integer(value))
    }

    pub fn nil() -> Self {
        Form::Constant(Constant::Null)
    }

    pub fn symbol(name: &str) -> Self {
        Form::Constant(Constant::Symbol(InternedSymbol::new(name)))
    }

    pub fn keyword(name: &str) -> Self {
        Form::symbol(&format!(":{name}"))
    }

    pub fn var(name: &str) -> Self {
        Form::Var(name.to_owned())
    }

    pub fn function(name: &str) -> Self {
        Form::Function(name.to_owned())
    }

    pub fn call(name: &str, args: impl IntoIterator<Item = Form>) -> Self {
        Form::funcall(Form::function(name), args)
    }

    pub fn funcall(callee: Form, args: impl IntoIterator<Item = Form>) -> Self {
        Form::Call {
            callee: Box::new(callee),
            args: args.into_iter().collect(),
        }
    }

    pub fn if_(test: Form, consequent: Form, alternative: Form) -> Self {
        Form::If(Box::new(test), Box::new(consequent), Box::new(alternative))
    }

    pub fn progn(forms: impl IntoIterator<Item = Form>) -> Self {
        Form::Progn(forms.into_iter().collect())
    }

    pub fn set(name: &str, value: Form) -> Self {
        Form::Set(name.to_owned(), Box::new(value))
    }

    pub fn the(ty: CType, form: Form) -> Self {
        Form::The(ty, Box::new(form))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub ty: CType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptionalParam {
    pub name: String,
    pub default: Constant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyParamSpec {
    pub keyword: String,
    pub name: String,
    pub default: Constant,
}

/// A function definition handed to [`ComponentBuilder`]
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSpec {
    pub name: String,
    pub params: Vec<Param>,
    pub optional: Vec<OptionalParam>,
    pub keys: Vec<KeyParamSpec>,
    pub allow_other_keys: bool,
    pub body: Form,
    pub exported: bool,
    pub policy: Option<Policy>,
}

impl FunctionSpec {
    pub fn new(name: &str, params: &[&str], body: Form) -> Self {
        Self {
            name: name.to_owned(),
            params: params
                .iter()
                .map(|p| Param {
                    name: (*p).to_owned(),
                    ty: CType::Any,
                })
                .collect(),
            optional: Vec::new(),
            keys: Vec::new(),
            allow_other_keys: false,
            body,
            exported: false,
            policy: None,
        }
    }

    /// Declares the type of a required parameter
    pub fn param_type(mut self, name: &str, ty: CType) -> Self {
        if let Some(param) = self.params.iter_mut().find(|p| p.name == name) {
            param.ty = ty;
        }
        self
    }

    pub fn optional(mut self, name: &str, default: Constant) -> Self {
        self.optional.push(OptionalParam {
            name: name.to_owned(),
            default,
        });
        self
    }

    pub fn key(mut self, name: &str, default: Constant) -> Self {
        self.keys.push(KeyParamSpec {
            keyword: format!(":{name}"),
            name: name.to_owned(),
            default,
        });
        self
    }

    pub fn allow_other_keys(mut self) -> Self {
        self.allow_other_keys = true;
        self
    }

    pub fn exported(mut self) -> Self {
        self.exported = true;
        self
    }

    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = Some(policy);
        self
    }
}

/// Collects function definitions and converts them into one component
pub struct ComponentBuilder<'r> {
    name: String,
    registry: &'r TemplateRegistry,
    policy: Policy,
    specs: Vec<FunctionSpec>,
}

impl<'r> ComponentBuilder<'r> {
    pub fn new(name: &str, registry: &'r TemplateRegistry) -> Self {
        Self {
            name: name.to_owned(),
            registry,
            policy: Policy::default(),
            specs: Vec::new(),
        }
    }

    /// Policy of every function without its own
    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn function(mut self, spec: FunctionSpec) -> Self {
        self.specs.push(spec);
        self
    }

    pub fn build(self) -> Result<Component> {
        let mut component = Component::new(&self.name);
        let mut names: HashMap<String, LeafId> = HashMap::new();
        let mut bodies: Vec<(FunctionId, Form, Policy)> = Vec::new();

        for spec in &self.specs {
            if names.contains_key(&spec.name) {
                return Err(InternalError::DuplicateFunction(spec.name.clone()));
            }

            let policy = spec.policy.unwrap_or(self.policy);
            let required = spec
                .params
                .iter()
                .map(|p| (InternedSymbol::new(&p.name), p.ty.clone()))
                .collect::<Vec<_>>();

            if spec.optional.is_empty() && spec.keys.is_empty() {
                let name = InternedSymbol::new(&spec.name);
                let function =
                    component.make_function(name, FunctionKind::Plain, &required, None, policy);

                component.give_tail_set(function);
                component.functions[function].exported = spec.exported;
                component.link_blocks(component.head, component.functions[function].entry);

                names.insert(spec.name.clone(), component.functions[function].leaf);
                bodies.push((function, spec.body.clone(), policy));
                continue;
            }

            let (leaf, entries) = build_dispatch(&mut component, spec, &required, policy);
            names.insert(spec.name.clone(), leaf);
            bodies.extend(entries.into_iter().map(|(f, body)| (f, body, policy)));
        }

        for (function, body, policy) in bodies {
            let entry = component.functions[function].entry;
            let mut converter = Converter::new(
                &mut component,
                self.registry,
                &names,
                function,
                entry,
                policy,
            );

            converter.convert_function_body(&body)?;
        }

        let edges = component.edges.indices().collect::<Vec<_>>();
        for edge in edges {
            if !component.edges[edge].producers.is_empty() {
                component.rederive(edge);
            }
        }

        component.update_tail_flags();
        component.reanalyze = component.live_functions().collect();

        tracing::debug!(
            component = %component.name,
            functions = component.functions.len(),
            nodes = component.nodes.len(),
            "built component"
        );

        Ok(component)
    }
}

/// Creates the main entry and one entry point per accepted argument count.
/// Returns the dispatch leaf and the bodies to convert.
fn build_dispatch(
    component: &mut Component,
    spec: &FunctionSpec,
    required: &[(InternedSymbol, CType)],
    policy: Policy,
) -> (LeafId, Vec<(FunctionId, Form)>) {
    let name = &spec.name;
    let min_args = required.len();
    let max_args = min_args + spec.optional.len();

    let mut main_params = required.to_vec();
    main_params.extend(
        spec.optional
            .iter()
            .map(|o| o.name.as_str())
            .chain(spec.keys.iter().map(|k| k.name.as_str()))
            .map(|name| (InternedSymbol::new(name), CType::Any)),
    );

    let main = component.make_function(
        InternedSymbol::new(&format!("(main {name})")),
        FunctionKind::Optional,
        &main_params,
        None,
        policy,
    );
    component.give_tail_set(main);

    let main_leaf = component.functions[main].leaf;
    let mut bodies = vec![(main, spec.body.clone())];
    let mut entry_points = Vec::new();

    for count in min_args..=max_args {
        let params = main_params[..count].to_vec();
        let entry = component.make_function(
            InternedSymbol::new(&format!("(entry {name} {count})")),
            FunctionKind::Optional,
            &params,
            None,
            policy,
        );
        component.give_tail_set(entry);

        // Missing optionals and every keyword get their defaults
        let args = params
            .iter()
            .map(|(p, _)| Form::Var(p.value().to_owned()))
            .chain(spec.optional[count - min_args..].iter().map(|o| Form::Constant(o.default.clone())))
            .chain(spec.keys.iter().map(|k| Form::Constant(k.default.clone())))
            .collect::<Vec<_>>();

        bodies.push((entry, Form::funcall(Form::Leaf(main_leaf), args)));
        entry_points.push(entry);
    }

    let dispatch = component.dispatches.next_index();
    let leaf = component.leaves.push(Leaf {
        kind: LeafKind::Dispatch(dispatch),
        ty: CType::function(),
        refs: Vec::new(),
    });

    for function in entry_points.iter().chain([&main]) {
        component.functions[*function].dispatch = Some(dispatch);
    }

    component.dispatches.push(Dispatch {
        name: InternedSymbol::new(name),
        leaf,
        min_args,
        max_args,
        entry_points: entry_points.clone(),
        main_entry: main,
        keys: spec
            .keys
            .iter()
            .map(|k| KeyParam {
                keyword: InternedSymbol::new(&k.keyword),
                default: k.default.clone(),
            })
            .collect(),
        allow_other_keys: spec.allow_other_keys,
        external_entry: None,
        exported: spec.exported,
    });

    (leaf, bodies)
}

impl Component {
    /// Creates a function with an entry block holding only its binding node
    pub fn make_function(
        &mut self,
        name: InternedSymbol,
        kind: FunctionKind,
        params: &[(InternedSymbol, CType)],
        home: Option<FunctionId>,
        policy: Policy,
    ) -> FunctionId {
        let id = self.functions.next_index();

        let leaf = self.leaves.push(Leaf {
            kind: LeafKind::Function(id),
            ty: CType::function(),
            refs: Vec::new(),
        });

        let params = params
            .iter()
            .map(|(name, ty)| {
                self.leaves.push(Leaf {
                    kind: LeafKind::Variable {
                        name: *name,
                        home: id,
                        sets: Vec::new(),
                    },
                    ty: ty.clone(),
                    refs: Vec::new(),
                })
            })
            .collect();

        let entry_edge = self.new_edge();
        let entry = self.new_block_at(entry_edge, Some(home.unwrap_or(id)));

        let bind_output = self.new_edge();
        let bind = self.append_node(
            entry,
            NodeKind::Bind {
                function: id,
                values: None,
            },
            bind_output,
            ValuesType::wild(),
            policy,
        );

        self.functions.push(FunctionDef {
            name,
            kind,
            params,
            bind,
            entry,
            return_node: None,
            tail_set: None,
            leaf,
            home,
            lets: Vec::new(),
            calls: Vec::new(),
            external_entry: None,
            dispatch: None,
            exported: false,
        })
    }

    pub fn give_tail_set(&mut self, function: FunctionId) {
        let set = self.tail_sets.push(TailSet {
            functions: vec![function],
            return_type: ValuesType::nothing(),
            merged_into: None,
        });

        self.functions[function].tail_set = Some(set);
    }

    pub fn constant_leaf(&mut self, constant: Constant) -> LeafId {
        let ty = constant.ty();

        self.leaves.push(Leaf {
            kind: LeafKind::Constant(constant),
            ty,
            refs: Vec::new(),
        })
    }

    /// The leaf for a function outside the component, shared by every
    /// reference to the same name
    pub fn global_leaf(&mut self, name: InternedSymbol) -> LeafId {
        let existing = self
            .leaves
            .enumerate()
            .find(|(_, leaf)| leaf.kind == LeafKind::Global(name))
            .map(|(id, _)| id);

        existing.unwrap_or_else(|| {
            self.leaves.push(Leaf {
                kind: LeafKind::Global(name),
                ty: CType::function(),
                refs: Vec::new(),
            })
        })
    }

    /// Marks every call whose value goes straight to its home function's
    /// return, unless the policy asks to keep frames
    pub fn update_tail_flags(&mut self) {
        let nodes = self.live_nodes().collect::<Vec<_>>();

        for node in nodes {
            let Some(home) = self.home(node) else { continue };
            let tail = self.return_result(home) == Some(self.nodes[node].output)
                && self.nodes[node].policy.allows_tail_calls();

            if let Some(call) = self.call_mut(node) {
                call.tail = tail;
            }
        }
    }
}

/// Converts forms into nodes appended at the end of a current block
pub struct Converter<'c> {
    pub component: &'c mut Component,
    registry: &'c TemplateRegistry,
    names: &'c HashMap<String, LeafId>,
    /// Function whose parameters are in scope
    function: FunctionId,
    /// Function new blocks belong to
    home: FunctionId,
    block: BlockId,
    policy: Policy,
}

impl<'c> Converter<'c> {
    pub fn new(
        component: &'c mut Component,
        registry: &'c TemplateRegistry,
        names: &'c HashMap<String, LeafId>,
        function: FunctionId,
        block: BlockId,
        policy: Policy,
    ) -> Self {
        let home = component.blocks[block].function.unwrap_or(function);

        Self {
            component,
            registry,
            names,
            function,
            home,
            block,
            policy,
        }
    }

    pub fn block(&self) -> BlockId {
        self.block
    }

    /// Converts a function body and adds its return node
    pub fn convert_function_body(&mut self, body: &Form) -> Result<()> {
        let result = self.component.new_edge();
        let return_block = self.component.new_block_at(result, Some(self.home));

        self.convert(body, result)?;
        self.flow_into(result);

        let output = self.component.new_edge();
        let derived = self.component.rederive(result);
        let node = self.component.append_node(
            return_block,
            NodeKind::Return {
                function: self.function,
                result,
            },
            output,
            derived,
            self.policy,
        );

        let tail = self.component.tail;
        self.component.link_blocks(return_block, tail);
        self.component.functions[self.function].return_node = Some(node);

        Ok(())
    }

    /// Converts `form` so its value is delivered to `out`. Afterwards the
    /// current block is where control continues.
    pub fn convert(&mut self, form: &Form, out: EdgeId) -> Result<()> {
        match form {
            Form::Constant(constant) => {
                let leaf = self.component.constant_leaf(constant.clone());
                self.reference(leaf, out);
            }
            Form::Var(name) => {
                let leaf = self.variable(name)?;
                self.reference(leaf, out);
            }
            Form::Function(name) => {
                let leaf = self.function_leaf(name);
                self.reference(leaf, out);
            }
            Form::Leaf(leaf) => self.reference(*leaf, out),
            Form::The(ty, inner) => {
                let edge = &mut self.component.edges[out];
                edge.asserted = edge.asserted.intersection(&ValuesType::single(ty.clone()));
                if !edge.asserted.is_wild() {
                    edge.check = TypeCheck::Pending;
                }

                self.convert(inner, out)?;
            }
            Form::Progn(forms) => match forms.split_last() {
                None => self.convert(&Form::nil(), out)?,
                Some((last, init)) => {
                    for form in init {
                        let ignored = self.component.new_edge();
                        self.convert(form, ignored)?;
                    }

                    self.convert(last, out)?;
                }
            },
            Form::Set(name, value) => {
                let variable = self.variable(name)?;
                let edge = self.component.new_edge();
                self.convert(value, edge)?;

                let derived = self.component.rederive(edge);
                self.append(NodeKind::Set { variable, value: edge }, out, derived);
            }
            Form::Call { callee, args } => self.convert_call(callee, args, out)?,
            Form::If(test, consequent, alternative) => {
                let test_edge = self.component.new_edge();
                self.convert(test, test_edge)?;

                let consequent_edge = self.component.new_edge();
                let consequent_block = self.component.new_block_at(consequent_edge, Some(self.home));
                let alternative_edge = self.component.new_edge();
                let alternative_block =
                    self.component.new_block_at(alternative_edge, Some(self.home));

                let output = self.component.new_edge();
                self.append(
                    NodeKind::If {
                        test: test_edge,
                        consequent: consequent_block,
                        alternative: alternative_block,
                    },
                    output,
                    ValuesType::wild(),
                );

                self.component.link_blocks(self.block, consequent_block);
                self.component.link_blocks(self.block, alternative_block);

                self.block = consequent_block;
                self.convert(consequent, out)?;
                self.flow_into(out);

                self.block = alternative_block;
                self.convert(alternative, out)?;
                self.flow_into(out);

                self.block = self.join_block(out);
            }
        }

        Ok(())
    }

    fn convert_call(&mut self, callee: &Form, args: &[Form], out: EdgeId) -> Result<()> {
        let callee_edge = self.component.new_edge();
        self.convert(callee, callee_edge)?;

        let mut arg_edges = Vec::with_capacity(args.len());
        let mut arg_types = Vec::with_capacity(args.len());

        for arg in args {
            let edge = self.component.new_edge();
            self.convert(arg, edge)?;

            arg_types.push(self.component.rederive(edge).single_value_type());
            arg_edges.push(Some(edge));
        }

        let known = match callee {
            Form::Function(name) => {
                let leaf = self.function_leaf(name);
                match self.component.leaves[leaf].kind {
                    LeafKind::Global(name) => self.registry.known(name),
                    _ => None,
                }
            }
            _ => None,
        };

        let derived = match known {
            Some(known) => (known.derive)(&arg_types),
            None => ValuesType::wild(),
        };

        self.append(
            NodeKind::Call(Call {
                kind: CallKind::Full,
                callee: callee_edge,
                args: arg_edges,
                tail: false,
                template: None,
                fused_branch: false,
            }),
            out,
            derived,
        );

        Ok(())
    }

    fn append(&mut self, kind: NodeKind, out: EdgeId, derived: ValuesType) {
        self.component
            .append_node(self.block, kind, out, derived, self.policy);
    }

    fn reference(&mut self, leaf: LeafId, out: EdgeId) {
        let derived = ValuesType::single(self.component.leaves[leaf].ty.clone());
        self.append(NodeKind::Ref { leaf }, out, derived);
    }

    /// Control continues at the block `out` starts, which is created when
    /// this is the first branch to reach it
    pub fn flow_into(&mut self, out: EdgeId) {
        let join = self.join_block(out);

        if self.block != join {
            self.component.link_blocks(self.block, join);
        }
    }

    fn join_block(&mut self, out: EdgeId) -> BlockId {
        match self.component.edges[out].block {
            Some(block) if self.component.edges[out].starts_block() => block,
            _ => self.component.new_block_at(out, Some(self.home)),
        }
    }

    fn variable(&self, name: &str) -> Result<LeafId> {
        let params = &self.component.functions[self.function].params;

        params
            .iter()
            .copied()
            .find(|leaf| match &self.component.leaves[*leaf].kind {
                LeafKind::Variable { name: n, .. } => n.value() == name,
                _ => false,
            })
            .ok_or_else(|| InternalError::UnboundVariable {
                variable: name.to_owned(),
                function: self.component.functions[self.function].name.to_string(),
            })
    }

    fn function_leaf(&mut self, name: &str) -> LeafId {
        match self.names.get(name) {
            Some(leaf) => *leaf,
            None => self.component.global_leaf(InternedSymbol::new(name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::targets::Target;

    #[test]
    fn if_branches_join_at_the_result() {
        let registry = Target::X86_64.template_registry();
        let component = ComponentBuilder::new("join", &registry)
            .function(FunctionSpec::new(
                "choose",
                &["flag"],
                Form::if_(Form::var("flag"), Form::int(1), Form::int(2)),
            ))
            .build()
            .unwrap();

        let function = component.function_by_name("choose").unwrap();
        let result = component.return_result(function).unwrap();

        assert_eq!(component.edges[result].producers.len(), 2);
        assert_eq!(
            component.edges[result].derived,
            ValuesType::single(CType::int_range(Some(1), Some(2)))
        );
        assert!(component.verify().is_empty(), "{:?}", component.verify());
    }

    #[test]
    fn known_calls_get_derived_types() {
        let registry = Target::X86_64.template_registry();
        let component = ComponentBuilder::new("derive", &registry)
            .function(
                FunctionSpec::new("add", &["a"], Form::call("+", [Form::var("a"), Form::int(1)]))
                    .param_type("a", CType::int_range(Some(0), Some(9))),
            )
            .build()
            .unwrap();

        let function = component.function_by_name("add").unwrap();
        let result = component.return_result(function).unwrap();
        let call = component.sole_producer(result).unwrap();

        assert_eq!(
            component.nodes[call].derived,
            ValuesType::single(CType::int_range(Some(1), Some(10)))
        );
        assert!(component.call(call).unwrap().tail);
    }

    #[test]
    fn unbound_variables_are_reported() {
        let registry = Target::X86_64.template_registry();
        let error = ComponentBuilder::new("unbound", &registry)
            .function(FunctionSpec::new("f", &[], Form::var("x")))
            .build()
            .unwrap_err();

        assert_eq!(
            error,
            InternalError::UnboundVariable {
                variable: "x".to_owned(),
                function: "f".to_owned(),
            }
        );
    }

    #[test]
    fn optional_parameters_get_entry_points() {
        let registry = Target::X86_64.template_registry();
        let component = ComponentBuilder::new("optional", &registry)
            .function(
                FunctionSpec::new("f", &["a"], Form::var("b"))
                    .optional("b", Constant::Integer(0))
                    .key("c", Constant::Null),
            )
            .build()
            .unwrap();

        let dispatch = &component.dispatches[component.dispatch_by_name("f").unwrap()];

        assert_eq!((dispatch.min_args, dispatch.max_args), (1, 2));
        assert_eq!(dispatch.entry_points.len(), 2);
        assert_eq!(component.functions[dispatch.main_entry].params.len(), 3);
        assert!(component.verify().is_empty(), "{:?}", component.verify());
    }
}
