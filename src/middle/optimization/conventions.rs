//! The last pass before instruction selection: every known call gets the
//! template it will be generated with and every edge gets the convention its
//! value is delivered with.

use itertools::Itertools;

use crate::{
    backend::templates::{CallShape, Rejection, TemplateId},
    error::{InternalError, Result},
    intern::InternedSymbol,
    middle::{
        CompilationContext,
        ctype::{CType, ValuesType},
        flow::{
            CallKind, Component, Convention, EdgeId, EdgeKind, LeafKind, NodeId, NodeKind,
            TailSetId,
        },
        optimization::local_calls::call_context,
        policy::SafetyClass,
    },
};

/// Outcome of template selection for one call
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub chosen: Option<TemplateId>,
    /// Every template that could not be used, cheapest first
    pub rejected: Vec<(TemplateId, Rejection)>,
}

pub fn annotate_conventions(component: &mut Component, ctx: &mut CompilationContext) -> Result<()> {
    let edges = component
        .edges
        .enumerate()
        .filter(|(_, e)| !e.producers.is_empty())
        .map(|(id, _)| id)
        .collect::<Vec<_>>();
    for edge in &edges {
        component.rederive(*edge);
    }

    let known = component
        .live_nodes()
        .filter_map(|n| match component.call(n)?.kind {
            CallKind::Known(name) => Some((n, name)),
            _ => None,
        })
        .collect::<Vec<_>>();

    rederive_known_calls(component, ctx, &known);
    infer_return_types(component);

    for (node, name) in known {
        annotate_known_call(component, ctx, node, name)?;
    }

    for edge in edges {
        if component.edges[edge].kind == EdgeKind::Deleted {
            continue;
        }

        let convention = choose_convention(component, edge);
        component.edges[edge].convention = Some(convention);

        if convention == Convention::Unknown {
            record_stack_use(component, edge);
        }
    }

    Ok(())
}

/// Checks narrowed some operands after the calls reading them were built.
/// Result types are derived again until nothing changes; they only ever
/// shrink.
fn rederive_known_calls(
    component: &mut Component,
    ctx: &CompilationContext,
    known: &[(NodeId, InternedSymbol)],
) {
    for _ in 0..=known.len() {
        let mut changed = false;

        for (node, name) in known {
            let Some(function) = ctx.registry.known(*name) else {
                continue;
            };
            let Some(call) = component.call(*node) else {
                continue;
            };

            let args = call
                .args
                .iter()
                .map(|arg| match arg {
                    Some(edge) => component.edges[*edge].derived.single_value_type(),
                    None => CType::Any,
                })
                .collect::<Vec<_>>();

            let derived = (function.derive)(&args).intersection(&component.nodes[*node].derived);
            if derived != component.nodes[*node].derived {
                component.nodes[*node].derived = derived;
                let output = component.nodes[*node].output;
                component.rederive(output);
                changed = true;
            }
        }

        if !changed {
            break;
        }
    }
}

/// Joins the types returned by the members of each tail set. Values a
/// member gets by tail calling another member are already counted.
fn infer_return_types(component: &mut Component) {
    let sets = component
        .tail_sets
        .enumerate()
        .filter(|(_, s)| s.merged_into.is_none())
        .map(|(id, _)| id)
        .collect::<Vec<_>>();

    for set in sets {
        let mut return_type = ValuesType::nothing();

        for function in component.tail_sets[set].functions.clone() {
            let Some(result) = component.return_result(function) else {
                continue;
            };

            for producer in &component.edges[result].producers {
                if calls_into_set(component, *producer, set) {
                    continue;
                }

                return_type = return_type.union(&component.nodes[*producer].derived);
            }
        }

        tracing::trace!(?set, %return_type, "inferred tail set return type");
        component.tail_sets[set].return_type = return_type;
    }
}

fn calls_into_set(component: &Component, node: NodeId, set: TailSetId) -> bool {
    let Some(call) = component.call(node) else {
        return false;
    };

    if !matches!(call.kind, CallKind::Local | CallKind::Assignment) {
        return false;
    }

    let callee = component
        .sole_producer(call.callee)
        .and_then(|r| component.ref_leaf(r))
        .map(|leaf| &component.leaves[leaf].kind);

    match callee {
        Some(LeafKind::Function(function)) => component.tail_set(*function) == Some(set),
        _ => false,
    }
}

/// The operand types, constants and result type template selection looks at
fn call_shape(component: &Component, node: NodeId) -> Option<CallShape<'_>> {
    let call = component.call(node)?;

    let args = call
        .args
        .iter()
        .map(|arg| match arg {
            Some(edge) => component.edges[*edge].derived.single_value_type(),
            None => CType::Any,
        })
        .collect();

    let constants = call
        .args
        .iter()
        .map(|arg| {
            let leaf = component.ref_leaf(component.sole_producer((*arg)?)?)?;

            match &component.leaves[leaf].kind {
                LeafKind::Constant(constant) => Some(constant),
                _ => None,
            }
        })
        .collect();

    Some(CallShape {
        args,
        constants,
        result: component.nodes[node].derived.single_value_type(),
    })
}

/// Picks the template for a known call. Among the templates that fit, one
/// made for the node's exact policy bucket wins, then one that is safe
/// everywhere, then the cheapest the bucket admits.
pub fn select_template(
    component: &Component,
    ctx: &CompilationContext,
    node: NodeId,
    name: InternedSymbol,
) -> Result<Selection> {
    let shape = call_shape(component, node).ok_or(InternalError::NotACall(node))?;
    let bucket = component.nodes[node].policy.bucket();
    let registry = ctx.registry;

    let mut admitted = Vec::new();
    let mut rejected = Vec::new();

    for id in registry.templates_for(name) {
        let template = registry.get(*id);

        match template.applies_to(&shape, &ctx.options.target_features) {
            Err(rejection) => rejected.push((*id, rejection)),
            Ok(()) if bucket.admits(template.policy) => admitted.push(*id),
            Ok(()) => rejected.push((*id, Rejection::Policy(template.policy))),
        }
    }

    let chosen = admitted
        .iter()
        .find(|id| registry.get(**id).policy == bucket)
        .or_else(|| {
            admitted
                .iter()
                .find(|id| registry.get(**id).policy == SafetyClass::Safe)
        })
        .or_else(|| admitted.first())
        .copied();

    Ok(Selection { chosen, rejected })
}

fn annotate_known_call(
    component: &mut Component,
    ctx: &mut CompilationContext,
    node: NodeId,
    name: InternedSymbol,
) -> Result<()> {
    let selection = select_template(component, ctx, node, name)?;
    let policy = component.nodes[node].policy;
    let limit = ctx.options.max_rejected_templates;

    let Some(chosen) = selection.chosen else {
        if let Some(call) = component.call_mut(node) {
            call.kind = CallKind::Full;
            call.template = None;
        }

        tracing::debug!(?node, %name, "no template, using a full call");

        if policy.efficiency_notes_enabled() {
            let context = call_context(component, node);
            let message = format!(
                "unable to use any template for {name}: {}",
                describe_rejections(ctx, &selection.rejected, limit)
            );
            ctx.diagnostics.note(&policy, context, message);
        }

        return Ok(());
    };

    let template = ctx.registry.get(chosen);
    let output = component.nodes[node].output;
    let fused = template.conditional
        && component.edges[output].consumer.is_some_and(|consumer| {
            matches!(component.nodes[consumer].kind, NodeKind::If { test, .. } if test == output)
        });

    tracing::debug!(?node, %name, template = template.name, fused, "chose template");

    let cheaper = selection
        .rejected
        .iter()
        .filter(|(id, _)| ctx.registry.get(*id).cost < template.cost)
        .cloned()
        .collect::<Vec<_>>();
    let cheapest = cheaper.iter().map(|(id, _)| ctx.registry.get(*id).cost).min();

    if let Some(cheapest) = cheapest {
        if template.cost - cheapest > ctx.options.note_cost_threshold
            && policy.efficiency_notes_enabled()
        {
            let context = call_context(component, node);
            let message = format!(
                "using {} (cost {}) since cheaper templates do not apply: {}",
                template.name,
                template.cost,
                describe_rejections(ctx, &cheaper, limit)
            );
            ctx.diagnostics.note(&policy, context, message);
        }
    }

    if let Some(call) = component.call_mut(node) {
        call.template = Some(chosen);
        call.fused_branch = fused;
    }

    Ok(())
}

fn describe_rejections(
    ctx: &CompilationContext,
    rejected: &[(TemplateId, Rejection)],
    limit: usize,
) -> String {
    if rejected.is_empty() {
        return "no templates".to_owned();
    }

    let listed = rejected
        .iter()
        .take(limit)
        .map(|(id, rejection)| format!("{} ({rejection})", ctx.registry.get(*id).name))
        .join(", ");

    match rejected.len().saturating_sub(limit) {
        0 => listed,
        more => format!("{listed} and {more} more"),
    }
}

/// A reference that can be read where it is used instead of being
/// materialized: a constant, or a variable nothing assigns
fn delayable_ref(component: &Component, edge: EdgeId) -> bool {
    if component.edges[edge].starts_block() {
        return false;
    }

    let Some(leaf) = component
        .sole_producer(edge)
        .and_then(|p| component.ref_leaf(p))
    else {
        return false;
    };

    match &component.leaves[leaf].kind {
        LeafKind::Constant(_) => true,
        LeafKind::Variable { sets, .. } => sets.is_empty(),
        _ => false,
    }
}

fn is_global_ref(component: &Component, edge: EdgeId) -> bool {
    component
        .sole_producer(edge)
        .and_then(|p| component.ref_leaf(p))
        .is_some_and(|leaf| matches!(component.leaves[leaf].kind, LeafKind::Global(_)))
}

fn count_convention(count: Option<usize>) -> Convention {
    match count {
        Some(1) => Convention::FixedOne,
        Some(count) => Convention::Fixed(count),
        None => Convention::Unknown,
    }
}

fn choose_convention(component: &Component, edge: EdgeId) -> Convention {
    let Some(consumer) = component.edges[edge].consumer else {
        return Convention::Fixed(0);
    };

    let fused = component
        .sole_producer(edge)
        .and_then(|p| component.call(p))
        .is_some_and(|call| call.fused_branch);
    if fused {
        return Convention::Fixed(0);
    }

    match &component.nodes[consumer].kind {
        NodeKind::Call(call) if call.callee == edge => match call.kind {
            CallKind::Local | CallKind::Let | CallKind::Assignment => Convention::Delayed,
            _ if is_global_ref(component, edge) => Convention::Delayed,
            _ => Convention::FixedOne,
        },
        NodeKind::Call(call) if matches!(call.kind, CallKind::Known(_)) => {
            if delayable_ref(component, edge) {
                Convention::Delayed
            } else {
                Convention::FixedOne
            }
        }
        NodeKind::If { .. } | NodeKind::Set { .. } if delayable_ref(component, edge) => {
            Convention::Delayed
        }
        NodeKind::Return { .. } if delayable_ref(component, edge) => Convention::Delayed,
        NodeKind::Return { function, .. } => {
            let count = match component.tail_set(*function) {
                Some(set) => component.tail_sets[set].return_type.value_count(),
                None => component.edges[edge].derived.value_count(),
            };

            count_convention(count)
        }
        NodeKind::Bind {
            function,
            values: Some(values),
        } if *values == edge => count_convention(Some(component.functions[*function].params.len())),
        _ => Convention::FixedOne,
    }
}

/// Values of unknown count are left on the stack by the producing blocks
/// and taken off by the consuming one
fn record_stack_use(component: &mut Component, edge: EdgeId) {
    for producer in component.edges[edge].producers.clone() {
        let block = component.nodes[producer].block;
        if !component.blocks[block].pushed.contains(&edge) {
            component.blocks[block].pushed.push(edge);
        }
    }

    if let Some(consumer) = component.edges[edge].consumer {
        let block = component.nodes[consumer].block;
        if !component.blocks[block].popped.contains(&edge) {
            component.blocks[block].popped.push(edge);
        }
    }
}
