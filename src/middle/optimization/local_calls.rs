//! Call-graph optimization. Calls through a reference to a function of the
//! same component become direct local calls, functions referenced in any
//! other way get an external entry, and functions that end up with a single
//! caller are merged into it (see [`super::let_conversion`]).

use hashbrown::HashMap;

use crate::{
    diagnostics::DiagnosticContext,
    error::{InternalError, Result},
    intern::InternedSymbol,
    middle::{
        CompilationContext,
        ctype::{CType, ValuesType},
        flow::{
            CallKind, Component, Constant, DispatchId, EdgeId, EdgeKind, FunctionId, FunctionKind,
            LeafId, LeafKind, NodeId, NodeKind,
            build::{Converter, Form},
        },
        optimization::let_conversion,
    },
};

/// What an external entry dispatches to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryTarget {
    Function(FunctionId),
    Dispatch(DispatchId),
}

pub fn optimize_local_calls(component: &mut Component, ctx: &mut CompilationContext) -> Result<()> {
    let exported_functions = component
        .live_functions()
        .filter(|f| {
            let def = &component.functions[*f];
            def.exported && def.kind == FunctionKind::Plain
        })
        .collect::<Vec<_>>();
    let exported_dispatches = component
        .dispatches
        .enumerate()
        .filter(|(_, d)| d.exported)
        .map(|(id, _)| id)
        .collect::<Vec<_>>();

    for function in exported_functions {
        ensure_external_entry(component, ctx, EntryTarget::Function(function))?;
    }

    for dispatch in exported_dispatches {
        ensure_external_entry(component, ctx, EntryTarget::Dispatch(dispatch))?;
    }

    while !component.reanalyze.is_empty() {
        let function = component.reanalyze.remove(0);

        if !component.functions[function].is_live() {
            continue;
        }

        resolve_references(component, ctx, function)?;
        let_conversion::maybe_convert(component, ctx, function)?;
    }

    recognize_known_calls(component, ctx);
    component.update_tail_flags();

    Ok(())
}

/// Looks at every reference to the function (and to its dispatch when it is
/// a main entry) and converts what can be converted
fn resolve_references(
    component: &mut Component,
    ctx: &mut CompilationContext,
    function: FunctionId,
) -> Result<()> {
    let mut leaves = vec![component.functions[function].leaf];

    if let Some(dispatch) = component.functions[function].dispatch {
        if component.dispatches[dispatch].main_entry == function {
            leaves.push(component.dispatches[dispatch].leaf);
        }
    }

    for leaf in leaves {
        for reference in component.leaves[leaf].refs.clone() {
            if component.nodes[reference].deleted {
                continue;
            }

            resolve_reference(component, ctx, reference, leaf)?;
        }
    }

    Ok(())
}

fn resolve_reference(
    component: &mut Component,
    ctx: &mut CompilationContext,
    reference: NodeId,
    leaf: LeafId,
) -> Result<()> {
    let output = component.nodes[reference].output;

    let Some(consumer) = component.edges[output].consumer else {
        if component.edges[output].kind == EdgeKind::InsideBlock {
            tracing::trace!(?reference, "deleting unused reference");
            component.delete_node(reference);
            component.edges[output].kind = EdgeKind::Deleted;
        }
        return Ok(());
    };

    match component.call(consumer) {
        Some(call) if call.callee == output => {
            if call.kind == CallKind::Full {
                convert_call(component, ctx, consumer, leaf)?;
            }
        }
        _ => {
            // The function escapes as a value: it must be callable the
            // generic way
            let target = match component.leaves[leaf].kind {
                LeafKind::Function(function) => {
                    if !convertible(component, function) {
                        return Ok(());
                    }
                    EntryTarget::Function(function)
                }
                LeafKind::Dispatch(dispatch) => EntryTarget::Dispatch(dispatch),
                _ => return Ok(()),
            };

            let entry = ensure_external_entry(component, ctx, target)?;
            let entry_leaf = component.functions[entry].leaf;
            component.retarget_ref(reference, entry_leaf);
        }
    }

    Ok(())
}

fn convertible(component: &Component, function: FunctionId) -> bool {
    matches!(
        component.functions[function].kind,
        FunctionKind::Plain | FunctionKind::Optional
    )
}

/// Resolves a full call through a reference to `leaf`
fn convert_call(
    component: &mut Component,
    ctx: &mut CompilationContext,
    node: NodeId,
    leaf: LeafId,
) -> Result<()> {
    let call = component.call(node).ok_or(InternalError::NotACall(node))?;
    let count = call.args.len();

    match component.leaves[leaf].kind {
        LeafKind::Function(function) => {
            if !convertible(component, function) {
                return Ok(());
            }

            let wanted = component.functions[function].params.len();
            if count != wanted {
                let message = format!(
                    "called with {count} argument{}, but wants exactly {wanted}",
                    plural(count)
                );
                return arity_error(component, ctx, node, message);
            }

            convert_to_local(component, node, function)
        }
        LeafKind::Dispatch(dispatch) => convert_dispatch_call(component, ctx, node, dispatch),
        _ => Ok(()),
    }
}

fn convert_dispatch_call(
    component: &mut Component,
    ctx: &mut CompilationContext,
    node: NodeId,
    dispatch: DispatchId,
) -> Result<()> {
    let data = component.dispatches[dispatch].clone();
    let call = component.call(node).ok_or(InternalError::NotACall(node))?.clone();
    let count = call.args.len();

    if count < data.min_args {
        let message = format!(
            "called with {count} argument{}, but wants at least {}",
            plural(count),
            data.min_args
        );
        return arity_error(component, ctx, node, message);
    }

    if count <= data.max_args {
        let entry = data.entry_points[count - data.min_args];
        return convert_to_local(component, node, entry);
    }

    if data.keys.is_empty() {
        let message = format!(
            "called with {count} argument{}, but wants at most {}",
            plural(count),
            data.max_args
        );
        return arity_error(component, ctx, node, message);
    }

    let extra = &call.args[data.max_args..];
    if extra.len() % 2 != 0 {
        return arity_error(component, ctx, node, "odd number of keyword arguments".to_owned());
    }

    let mut supplied: Vec<Option<EdgeId>> = vec![None; data.keys.len()];
    let mut unused = Vec::new();

    for pair in extra.chunks(2) {
        let [Some(key), Some(value)] = [pair[0], pair[1]] else {
            continue;
        };

        let Some(keyword) = constant_symbol(component, key) else {
            // Can only be sorted out at run time
            tracing::debug!(?node, "keyword is not constant, calling through external entry");
            let entry = ensure_external_entry(component, ctx, EntryTarget::Dispatch(dispatch))?;
            let entry_leaf = component.functions[entry].leaf;
            if let Some(callee) = component.sole_producer(call.callee) {
                component.retarget_ref(callee, entry_leaf);
            }
            return Ok(());
        };

        match data.keys.iter().position(|k| k.keyword == keyword) {
            Some(index) if supplied[index].is_none() => supplied[index] = Some(value),
            // The leftmost occurrence of a keyword wins
            Some(_) => unused.push(value),
            None if data.allow_other_keys => unused.push(value),
            None => {
                let message = format!("unknown keyword {keyword}");
                return arity_error(component, ctx, node, message);
            }
        }

        unused.push(key);
    }

    let policy = component.nodes[node].policy;
    let mut args = call.args[..data.max_args].to_vec();

    for (key, value) in data.keys.iter().zip(supplied) {
        let value = match value {
            Some(value) => value,
            None => {
                let leaf = component.constant_leaf(key.default.clone());
                let edge = component.new_edge();
                let derived = ValuesType::single(component.leaves[leaf].ty.clone());

                component.insert_node_before(
                    node,
                    NodeKind::Ref { leaf },
                    edge,
                    derived,
                    policy,
                )?;
                component.edges[edge].consumer = Some(node);
                edge
            }
        };

        args.push(Some(value));
    }

    for edge in unused {
        component.release_operand(edge);
    }

    if let Some(call) = component.call_mut(node) {
        call.args = args;
    }

    convert_to_local(component, node, data.main_entry)
}

fn constant_symbol(component: &Component, edge: EdgeId) -> Option<InternedSymbol> {
    let leaf = component.ref_leaf(component.sole_producer(edge)?)?;

    match component.leaves[leaf].kind {
        LeafKind::Constant(Constant::Symbol(symbol)) => Some(symbol),
        _ => None,
    }
}

fn plural(count: usize) -> &'static str {
    if count == 1 { "" } else { "s" }
}

/// Reports the problem once and marks the call so it is never looked at
/// again
fn arity_error(
    component: &mut Component,
    ctx: &mut CompilationContext,
    node: NodeId,
    message: String,
) -> Result<()> {
    let context = call_context(component, node);
    ctx.diagnostics.warning(context, message);

    let call = component.call_mut(node).ok_or(InternalError::NotACall(node))?;
    call.kind = CallKind::Error;

    Ok(())
}

pub(crate) fn call_context(component: &Component, node: NodeId) -> DiagnosticContext {
    let function = component.home(node).map(|f| component.functions[f].name);
    let operation = match component.call(node).and_then(|call| component.callee_name(call)) {
        Some(name) => format!("call to {name}"),
        None => "call".to_owned(),
    };

    DiagnosticContext::new(function, operation)
}

/// Makes `node` a direct call to `function`
fn convert_to_local(component: &mut Component, node: NodeId, function: FunctionId) -> Result<()> {
    let call = component.call(node).ok_or(InternalError::NotACall(node))?.clone();

    let callee = component
        .sole_producer(call.callee)
        .ok_or(InternalError::MissingProducer(call.callee))?;
    let leaf = component.functions[function].leaf;
    if component.ref_leaf(callee) != Some(leaf) {
        component.retarget_ref(callee, leaf);
    }

    // Arguments of parameters nothing reads are dropped, keeping positions
    let params = component.functions[function].params.clone();
    let mut args = call.args.clone();
    for (arg, param) in args.iter_mut().zip(&params) {
        if let Some(edge) = *arg {
            if component.leaves[*param].refs.is_empty() {
                component.release_operand(edge);
                *arg = None;
            }
        }
    }

    let output = component.nodes[node].output;
    let tail_allowed = component.nodes[node].policy.allows_tail_calls();

    if let Some(call) = component.call_mut(node) {
        call.kind = CallKind::Local;
        call.args = args;
    }

    if let Some(home) = component.home(node) {
        if !component.functions[home].calls.contains(&function) {
            component.functions[home].calls.push(function);
        }

        if tail_allowed && component.return_result(home) == Some(output) {
            merge_tail_sets(component, home, function);
        }
    }

    tracing::debug!(
        ?node,
        callee = %component.functions[function].name,
        "converted to local call"
    );

    component.queue_function(function);
    Ok(())
}

/// Joins the tail sets of two functions. Merging a pair that already shares
/// a set changes nothing.
pub fn merge_tail_sets(component: &mut Component, a: FunctionId, b: FunctionId) {
    let (Some(into), Some(from)) = (component.tail_set(a), component.tail_set(b)) else {
        return;
    };

    if into == from {
        return;
    }

    let moved = std::mem::take(&mut component.tail_sets[from].functions);
    for function in &moved {
        component.functions[*function].tail_set = Some(into);
    }

    let return_type = component.tail_sets[from].return_type.clone();
    let set = &mut component.tail_sets[into];
    set.functions.extend(moved);
    set.return_type = set.return_type.union(&return_type);

    component.tail_sets[from].merged_into = Some(into);

    tracing::trace!(?into, ?from, "merged tail sets");
}

/// Gives a function (or a dispatch) its generic-convention wrapper, creating
/// it the first time it is needed. The wrapper takes the argument count and
/// the arguments, checks the count and calls the matching entry.
pub fn ensure_external_entry(
    component: &mut Component,
    ctx: &mut CompilationContext,
    target: EntryTarget,
) -> Result<FunctionId> {
    let existing = match target {
        EntryTarget::Function(f) => component.functions[f].external_entry,
        EntryTarget::Dispatch(d) => component.dispatches[d].external_entry,
    };

    if let Some(entry) = existing {
        return Ok(entry);
    }

    let (name, policy, arg_count) = match target {
        EntryTarget::Function(f) => {
            let def = &component.functions[f];
            (def.name, component.nodes[def.bind].policy, def.params.len())
        }
        EntryTarget::Dispatch(d) => {
            let data = &component.dispatches[d];
            let main = &component.functions[data.main_entry];
            (
                data.name,
                component.nodes[main.bind].policy,
                data.max_args + 2 * data.keys.len(),
            )
        }
    };

    let params = std::iter::once(InternedSymbol::new("count"))
        .chain((0..arg_count).map(|i| InternedSymbol::new(&format!("arg{i}"))))
        .map(|p| (p, CType::Any))
        .collect::<Vec<_>>();

    let entry = component.make_function(
        InternedSymbol::new(&format!("(xep {name})")),
        FunctionKind::External,
        &params,
        None,
        policy,
    );
    component.give_tail_set(entry);
    component.link_blocks(component.head, component.functions[entry].entry);

    let leaves = component.functions[entry].params.clone();
    let (form, targets) = match target {
        EntryTarget::Function(f) => (function_entry_form(component, f, &leaves), vec![f]),
        EntryTarget::Dispatch(d) => dispatch_entry_form(component, d, &leaves),
    };

    let names = HashMap::new();
    let block = component.functions[entry].entry;
    Converter::new(component, ctx.registry, &names, entry, block, policy)
        .convert_function_body(&form)?;

    match target {
        EntryTarget::Function(f) => component.functions[f].external_entry = Some(entry),
        EntryTarget::Dispatch(d) => component.dispatches[d].external_entry = Some(entry),
    }

    for function in targets {
        component.queue_function(function);
    }

    tracing::debug!(%name, "created external entry");

    Ok(entry)
}

fn count_is(count: LeafId, value: usize) -> Form {
    Form::call("eq", [Form::Leaf(count), Form::int(value as i64)])
}

fn arg_count_error(count: LeafId) -> Form {
    Form::call("%arg-count-error", [Form::Leaf(count)])
}

/// `(if (eq count n) (f arg0 ..) (%arg-count-error count))`
fn function_entry_form(component: &Component, function: FunctionId, params: &[LeafId]) -> Form {
    let def = &component.functions[function];
    let (count, args) = (params[0], &params[1..]);

    Form::if_(
        count_is(count, def.params.len()),
        Form::funcall(Form::Leaf(def.leaf), args.iter().map(|a| Form::Leaf(*a))),
        arg_count_error(count),
    )
}

/// One test per entry point. Anything longer goes to the main entry with
/// the keyword values looked up at run time.
fn dispatch_entry_form(
    component: &Component,
    dispatch: DispatchId,
    params: &[LeafId],
) -> (Form, Vec<FunctionId>) {
    let data = &component.dispatches[dispatch];
    let (count, args) = (params[0], &params[1..]);
    let (positional, keyword_area) = args.split_at(data.max_args);

    let fallback = if data.keys.is_empty() {
        arg_count_error(count)
    } else {
        let main = &component.functions[data.main_entry];
        let keys = data.keys.iter().map(|key| {
            let lookup = [
                Form::Leaf(count),
                Form::Constant(Constant::Symbol(key.keyword)),
                Form::Constant(key.default.clone()),
            ];

            Form::call(
                "%find-keyword",
                lookup
                    .into_iter()
                    .chain(keyword_area.iter().map(|a| Form::Leaf(*a))),
            )
        });

        Form::funcall(
            Form::Leaf(main.leaf),
            positional.iter().map(|a| Form::Leaf(*a)).chain(keys),
        )
    };

    let form = data
        .entry_points
        .iter()
        .enumerate()
        .rev()
        .fold(fallback, |inner, (i, entry)| {
            let n = data.min_args + i;
            let call = Form::funcall(
                Form::Leaf(component.functions[*entry].leaf),
                positional[..n].iter().map(|a| Form::Leaf(*a)),
            );

            Form::if_(count_is(count, n), call, inner)
        });

    let targets = data
        .entry_points
        .iter()
        .copied()
        .chain([data.main_entry])
        .collect();

    (form, targets)
}

/// Full calls to functions the back end implements directly become known
/// calls, to be given a template later
fn recognize_known_calls(component: &mut Component, ctx: &CompilationContext) {
    let nodes = component.live_nodes().collect::<Vec<_>>();

    for node in nodes {
        let Some(call) = component.call(node) else { continue };
        if call.kind != CallKind::Full {
            continue;
        }

        let Some(leaf) = component
            .sole_producer(call.callee)
            .and_then(|r| component.ref_leaf(r))
        else {
            continue;
        };

        let LeafKind::Global(name) = component.leaves[leaf].kind else {
            continue;
        };

        if !ctx.registry.templates_for(name).is_empty() {
            if let Some(call) = component.call_mut(node) {
                call.kind = CallKind::Known(name);
            }
            tracing::trace!(?node, %name, "recognized known call");
        }
    }
}
