//! Type-check synthesis. Every edge whose asserted type is not implied by
//! what its producers are known to deliver needs a run-time check. Checks
//! the back end can do while generating the consumer are recorded on the
//! edge; others are spliced in as explicit tests; the rest are dropped with
//! a note.

use hashbrown::HashMap;

use crate::{
    diagnostics::DiagnosticContext,
    error::{InternalError, Result},
    intern::InternedSymbol,
    middle::{
        CompilationContext,
        ctype::{Atom, CType, FIXNUM_MAX, FIXNUM_MIN, ValuesType},
        flow::{
            CallKind, Component, Constant, EdgeId, FunctionKind, LeafId, LeafKind, NodeId,
            NodeKind, TypeCheck,
            build::{Converter, Form},
        },
    },
};

/// How a required check will be carried out
#[derive(Debug, Clone, PartialEq)]
pub enum CheckStrategy {
    /// Each value is tested with a back-end check template
    Simple,
    /// An explicit test is spliced in front of the consumer
    Hairy,
    /// No test can be built
    TooHairy,
}

/// The test for one value. A negated test checks that the value is *not*
/// of `ty`.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueTest {
    pub ty: CType,
    pub negated: bool,
    /// The type the value must have, reported when the test fails
    pub asserted: CType,
}

/// The tests for every value of one edge, `None` where the value needs none
#[derive(Debug, Clone, PartialEq)]
pub struct CheckPlan {
    pub strategy: CheckStrategy,
    pub tests: Vec<Option<ValueTest>>,
}

pub fn generate_type_checks(component: &mut Component, ctx: &mut CompilationContext) -> Result<()> {
    let pending = component
        .edges
        .enumerate()
        .filter(|(_, edge)| edge.check == TypeCheck::Pending)
        .map(|(id, _)| id)
        .collect::<Vec<_>>();

    for edge in pending {
        if component.edges[edge].check == TypeCheck::Pending {
            check_edge(component, ctx, edge)?;
        }
    }

    Ok(())
}

fn check_edge(component: &mut Component, ctx: &mut CompilationContext, edge: EdgeId) -> Result<()> {
    let Some(consumer) = component.edges[edge].consumer else {
        tracing::trace!(?edge, "no consumer, nothing to check");
        component.edges[edge].check = TypeCheck::None;
        return Ok(());
    };

    let derived = component.rederive(edge);
    let asserted = component.edges[edge].asserted.clone();

    if derived.is_subtype_of(&asserted) {
        component.edges[edge].check = TypeCheck::None;
        return Ok(());
    }

    if proven_violation(component, ctx, edge, consumer, &derived, &asserted) {
        return Ok(());
    }

    let policy = component.nodes[consumer].policy;
    if policy.drops_checks() {
        tracing::trace!(?edge, "check dropped at zero safety");
        narrow_producers(component, edge);
        component.edges[edge].check = TypeCheck::Dropped;
        return Ok(());
    }

    let plan = plan_check(component, ctx, edge, consumer);

    tracing::debug!(?edge, strategy = ?plan.strategy, "classified type check");

    match plan.strategy {
        CheckStrategy::Simple => {
            let types = plan.tests.iter().flatten().map(|t| t.ty.clone()).collect::<Vec<_>>();
            let templates = types
                .iter()
                .map(|ty| ctx.registry.check_template(ty))
                .collect();

            narrow_producers(component, edge);
            component.edges[edge].check = TypeCheck::Simple { types, templates };
        }
        CheckStrategy::Hairy => splice_check(component, ctx, edge, consumer, &plan.tests)?,
        CheckStrategy::TooHairy => {
            if policy.check_notes_enabled() {
                let context = operation_context(component, consumer, "type check");
                ctx.diagnostics.note(
                    &policy,
                    context,
                    format!("type assertion too complex to check: {asserted}"),
                );
            }

            narrow_producers(component, edge);
            component.edges[edge].check = TypeCheck::Dropped;
        }
    }

    Ok(())
}

/// Replaces the producers of an edge that can never satisfy its assertion
/// with error stubs. Returns false when some value may still pass.
fn proven_violation(
    component: &mut Component,
    ctx: &mut CompilationContext,
    edge: EdgeId,
    consumer: NodeId,
    derived: &ValuesType,
    asserted: &ValuesType,
) -> bool {
    let count = checked_value_count(component, consumer, derived, asserted);

    let impossible = (0..count.unwrap_or(1)).any(|i| {
        let value = derived.nth(i);
        !value.is_nothing() && value.intersection(&asserted.nth(i)).is_nothing()
    });

    if !impossible {
        return false;
    }

    let message = format!("asserted type {asserted} conflicts with derived type {derived}");
    let context = operation_context(component, consumer, "type check");
    ctx.diagnostics.warning(context, message.clone());

    for producer in component.edges[edge].producers.clone() {
        component.replace_with_error_stub(producer, message.clone());
    }

    if let Some(call) = component.call_mut(consumer) {
        if call.kind == CallKind::Full {
            call.kind = CallKind::Error;
        }
    }

    component.edges[edge].derived = ValuesType::nothing();
    component.edges[edge].check = TypeCheck::Error;

    true
}

/// Number of values the consumer reads: one for ordinary operands, every
/// value for returns and multiple-value bindings. `None` when that is not
/// known.
fn checked_value_count(
    component: &Component,
    consumer: NodeId,
    derived: &ValuesType,
    asserted: &ValuesType,
) -> Option<usize> {
    if !reads_every_value(component, consumer) {
        return Some(1);
    }

    derived
        .value_count()
        .map(|count| count.max(asserted.required.len()))
}

fn reads_every_value(component: &Component, consumer: NodeId) -> bool {
    matches!(
        component.nodes[consumer].kind,
        NodeKind::Return { .. } | NodeKind::Bind { values: Some(_), .. }
    )
}

/// Works out which values need a test, what each test is and how the whole
/// check will be done
pub fn plan_check(
    component: &Component,
    ctx: &mut CompilationContext,
    edge: EdgeId,
    consumer: NodeId,
) -> CheckPlan {
    let data = &component.edges[edge];
    let derived = &data.derived;
    let asserted = &data.asserted;
    let policy = component.nodes[consumer].policy;

    let count = checked_value_count(component, consumer, derived, asserted);
    let multiple = reads_every_value(component, consumer);

    // With an unknown number of values only the asserted required values
    // can be tested, and only if the rest are unconstrained
    let rest_constrained = matches!(&asserted.rest, Some(rest) if !rest.is_any());
    let tested = count.unwrap_or(asserted.required.len());

    let tests = (0..tested)
        .map(|i| {
            let mut wanted = asserted
                .required
                .get(i)
                .cloned()
                .or_else(|| asserted.rest.clone())
                .unwrap_or(CType::Any);

            // Missing values read as null
            if multiple && derived.value_count().is_some_and(|n| i >= n) {
                wanted = wanted.union(&CType::null());
            }

            let value = derived.nth(i);
            if value.is_subtype_of(&wanted) {
                return None;
            }

            let target = if policy.weakens_checks() {
                weaken_type(ctx, &wanted)
            } else {
                wanted.clone()
            };

            if target.is_any() || value.is_subtype_of(&target) {
                return None;
            }

            Some(maybe_negate(ctx, &value, target, wanted))
        })
        .collect::<Vec<_>>();

    let force_hairy = match component.call(consumer) {
        Some(call) if call.kind == CallKind::Full => !consumer_is_known(component, ctx, consumer),
        _ => false,
    };

    let all_simple = tests.iter().flatten().all(|test| {
        !test.negated && ctx.registry.check_template(&test.ty).is_some()
    });

    let strategy = if tests.iter().all(Option::is_none) {
        CheckStrategy::Simple
    } else if multiple && (count.is_none() || rest_constrained) {
        if all_simple && !rest_constrained {
            CheckStrategy::Simple
        } else {
            CheckStrategy::TooHairy
        }
    } else if all_simple && !force_hairy {
        CheckStrategy::Simple
    } else {
        CheckStrategy::Hairy
    };

    CheckPlan { strategy, tests }
}

/// Whether the consumer is a call the back end implements directly, and so
/// checks its own operands
fn consumer_is_known(component: &Component, ctx: &CompilationContext, consumer: NodeId) -> bool {
    component
        .call(consumer)
        .and_then(|call| {
            let leaf = component.ref_leaf(component.sole_producer(call.callee)?)?;
            match component.leaves[leaf].kind {
                LeafKind::Global(name) => Some(ctx.registry.is_known(name)),
                _ => None,
            }
        })
        .unwrap_or(false)
}

/// Tests the complement when the part of the derived type that must be
/// rejected is cheaper to recognize than the part that must be accepted
fn maybe_negate(
    ctx: &mut CompilationContext,
    derived: &CType,
    target: CType,
    asserted: CType,
) -> ValueTest {
    if let Some(difference) = derived.difference(&target) {
        if !difference.is_nothing()
            && !derived.is_any()
            && type_test_cost(ctx, &difference) < type_test_cost(ctx, &target)
        {
            return ValueTest {
                ty: difference,
                negated: true,
                asserted,
            };
        }
    }

    ValueTest {
        ty: target,
        negated: false,
        asserted,
    }
}

/// Estimated cost of testing whether a value is of `ty`
pub fn type_test_cost(ctx: &mut CompilationContext, ty: &CType) -> u32 {
    if let Some(cost) = ctx.cached_cost(ty) {
        return cost;
    }

    let cost = match ctx.registry.predicate_for(ty) {
        Some(predicate) => predicate.cost,
        None => match ty {
            CType::Any => 0,
            CType::Union(atoms) => atoms.iter().map(|atom| atom_test_cost(ctx, atom)).sum(),
        },
    };

    ctx.cache_cost(ty.clone(), cost);
    cost
}

fn atom_test_cost(ctx: &mut CompilationContext, atom: &Atom) -> u32 {
    let single = CType::from_atoms([atom.clone()]);
    if let Some(predicate) = ctx.registry.predicate_for(&single) {
        return predicate.cost;
    }

    match atom {
        Atom::Integer { low, high } => {
            let in_fixnum_range = low.is_some_and(|l| l >= FIXNUM_MIN)
                && high.is_some_and(|h| h <= FIXNUM_MAX);
            let tag = if in_fixnum_range { 1 } else { 3 };

            tag + low.is_some() as u32 + high.is_some() as u32
        }
        Atom::Cons { car, cdr } => 1 + type_test_cost(ctx, car) + type_test_cost(ctx, cdr),
        Atom::Vector(element) => 2 + type_test_cost(ctx, element),
        _ => 2,
    }
}

/// The cheapest type with a direct test that contains `ty`, or the universal
/// type when there is none. Of equally cheap tests the one for `ty` itself
/// wins.
pub fn weaken_type(ctx: &mut CompilationContext, ty: &CType) -> CType {
    let mut min_cost = type_test_cost(ctx, ty);
    let mut min_type = None;

    let candidates = ctx
        .registry
        .predicates()
        .iter()
        .filter(|p| ty.is_subtype_of(&p.ty) && !p.ty.is_union())
        .map(|p| p.ty.clone())
        .collect::<Vec<_>>();

    for candidate in candidates {
        let cost = type_test_cost(ctx, &candidate);

        if cost < min_cost || candidate.equivalent(ty) {
            min_cost = cost;
            min_type = Some(candidate);
        }
    }

    min_type.unwrap_or(CType::Any)
}

/// Narrows the producers' derived types by the assertion: past the check
/// the consumer can rely on it
fn narrow_producers(component: &mut Component, edge: EdgeId) {
    let asserted = component.edges[edge].asserted.clone();

    for producer in component.edges[edge].producers.clone() {
        let node = &mut component.nodes[producer];
        node.derived = node.derived.intersection(&asserted);
    }

    component.rederive(edge);
}

/// Puts an explicit test between the producers of `edge` and its consumer.
/// The values are bound to the parameters of a new inline function whose
/// body tests each one and delivers them to `edge` when all pass.
fn splice_check(
    component: &mut Component,
    ctx: &mut CompilationContext,
    edge: EdgeId,
    consumer: NodeId,
    tests: &[Option<ValueTest>],
) -> Result<()> {
    let arity = if reads_every_value(component, consumer) { tests.len() } else { 1 };
    if tests.len() != arity {
        return Err(InternalError::CheckCountMismatch {
            checks: tests.len(),
            arity,
        });
    }

    let consumer_block = component.ensure_block_start(edge)?;
    let home = component.blocks[consumer_block]
        .function
        .ok_or(InternalError::MissingConsumer(edge))?;
    let policy = component.nodes[consumer].policy;

    let params = (0..arity)
        .map(|i| (InternedSymbol::new(&format!("value{i}")), CType::Any))
        .collect::<Vec<_>>();
    let name = InternedSymbol::new(&format!("(check {})", component.functions[home].name));
    let check = component.make_function(name, FunctionKind::Cleanup, &params, Some(home), policy);
    component.functions[home].lets.push(check);

    let check_block = component.functions[check].entry;
    let bind = component.functions[check].bind;
    let values = component.blocks[check_block]
        .start
        .ok_or(InternalError::PlaceholderMissing {
            edge,
            block: check_block,
        })?;

    // The producers now feed the binding of the check function
    component.move_producers(edge, values);
    component.nodes[bind].kind = NodeKind::Bind {
        function: check,
        values: Some(values),
    };
    component.edges[values].consumer = Some(bind);

    let delivered = component.rederive(values);
    let placeholders = component.functions[check].params.clone();
    for (i, param) in placeholders.iter().enumerate() {
        component.leaves[*param].ty = delivered.nth(i);
    }

    if component.blocks[check_block].nodes.first() != Some(&bind) {
        return Err(InternalError::PlaceholderMissing {
            edge,
            block: check_block,
        });
    }

    let form = check_form(&placeholders, tests);
    let names = HashMap::new();
    let mut converter = Converter::new(component, ctx.registry, &names, check, check_block, policy);
    converter.convert(&form, edge)?;
    converter.flow_into(edge);

    // Failed tests never return: their error calls end at the tail.
    // Whatever still reaches the consumer passed every test.
    let asserted = component.edges[edge].asserted.clone();
    for producer in component.edges[edge].producers.clone() {
        if component.nodes[producer].derived.is_nothing() {
            let block = component.nodes[producer].block;
            let ignored = component.new_edge();
            let tail = component.tail;

            component.set_output(producer, ignored);
            component.unlink_blocks(block, consumer_block);
            component.link_blocks(block, tail);
            continue;
        }

        let node = &mut component.nodes[producer];
        node.derived = node.derived.intersection(&asserted);
    }

    component.rederive(edge);
    component.edges[edge].check = TypeCheck::Resolved;

    tracing::debug!(?edge, function = %component.functions[home].name, "spliced type check");

    Ok(())
}

/// `(if (%typep v 'T) <rest> (%type-check-error v 'T 'ASSERTED))` for each
/// tested value, innermost delivering the values
fn check_form(placeholders: &[LeafId], tests: &[Option<ValueTest>]) -> Form {
    let deliver = match placeholders {
        [single] => Form::Leaf(*single),
        many => Form::call("values", many.iter().map(|p| Form::Leaf(*p))),
    };

    placeholders
        .iter()
        .zip(tests)
        .rev()
        .fold(deliver, |inner, (placeholder, test)| {
            let Some(test) = test else { return inner };

            let value = Form::Leaf(*placeholder);
            let ty = Form::Constant(Constant::Type(test.ty.clone()));
            let predicate = Form::call("%typep", [value.clone(), ty.clone()]);
            let error = Form::call(
                "%type-check-error",
                [value, ty, Form::Constant(Constant::Type(test.asserted.clone()))],
            );

            if test.negated {
                Form::if_(predicate, error, inner)
            } else {
                Form::if_(predicate, inner, error)
            }
        })
}

fn operation_context(component: &Component, node: NodeId, operation: &str) -> DiagnosticContext {
    let function = component.home(node).map(|f| component.functions[f].name);
    let operation = match component.call(node).and_then(|call| component.callee_name(call)) {
        Some(name) => format!("{operation} for call to {name}"),
        None => operation.to_owned(),
    };

    DiagnosticContext::new(function, operation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::targets::Target,
        config::PassOptions,
        diagnostics::CollectingSink,
    };

    #[test]
    fn costs_are_structural_and_cached() {
        let registry = Target::X86_64.template_registry();
        let options = PassOptions::default();
        let mut sink = CollectingSink::default();
        let mut ctx = CompilationContext::new(&options, &registry, &mut sink);

        assert_eq!(type_test_cost(&mut ctx, &CType::fixnum()), 1);
        assert_eq!(type_test_cost(&mut ctx, &CType::int_range(Some(0), Some(9))), 3);
        assert_eq!(
            type_test_cost(&mut ctx, &CType::fixnum().union(&CType::float())),
            3
        );
        assert_eq!(ctx.cached_cost(&CType::fixnum()), Some(1));
    }

    #[test]
    fn weakening_picks_the_cheapest_supertype() {
        let registry = Target::X86_64.template_registry();
        let options = PassOptions::default();
        let mut sink = CollectingSink::default();
        let mut ctx = CompilationContext::new(&options, &registry, &mut sink);

        assert_eq!(
            weaken_type(&mut ctx, &CType::int_range(Some(0), Some(9))),
            CType::fixnum()
        );
        assert_eq!(weaken_type(&mut ctx, &CType::fixnum()), CType::fixnum());
        assert_eq!(weaken_type(&mut ctx, &CType::Any), CType::Any);
    }

    #[test]
    fn complement_is_tested_when_cheaper() {
        let registry = Target::X86_64.template_registry();
        let options = PassOptions::default();
        let mut sink = CollectingSink::default();
        let mut ctx = CompilationContext::new(&options, &registry, &mut sink);

        let derived = CType::int_range(Some(0), Some(9)).union(&CType::null());
        let wanted = CType::int_range(Some(0), Some(9));
        let test = maybe_negate(&mut ctx, &derived, wanted.clone(), wanted);

        assert!(test.negated);
        assert_eq!(test.ty, CType::null());
    }
}
