mod common;

use pretty_assertions::assert_eq;

use flowmid::{
    backend::{
        targets::{Target, TargetFeature},
        templates::Rejection,
    },
    config::PassOptions,
    diagnostics::{CollectingSink, DiagnosticLevel},
    intern::InternedSymbol,
    middle::{
        CompilationContext,
        ctype::CType,
        flow::{
            CallKind, Component, Convention, NodeKind,
            build::{ComponentBuilder, Form, FunctionSpec},
        },
        optimization::conventions::select_template,
        policy::{Policy, SafetyClass},
    },
    samples::Sample,
};

use common::{assert_valid, compile, only_call_to};

fn small() -> CType {
    CType::int_range(Some(0), Some(100))
}

fn typed_unary(name: &str, ty: CType, policy: Policy, body: Form) -> Component {
    let registry = Target::X86_64.template_registry();

    ComponentBuilder::new(name, &registry)
        .policy(policy)
        .function(
            FunctionSpec::new(name, &["x"], body)
                .param_type("x", ty)
                .exported(),
        )
        .build()
        .unwrap()
}

fn unary(name: &str, policy: Policy, body: Form) -> Component {
    typed_unary(name, small(), policy, body)
}

fn increment(policy: Policy) -> Component {
    unary("inc", policy, Form::call("+", [Form::var("x"), Form::int(1)]))
}

fn template_name(component: &Component, function: &str) -> Option<&'static str> {
    let registry = Target::X86_64.template_registry();
    let call = only_call_to(component, function);

    component
        .call(call)
        .unwrap()
        .template
        .map(|t| registry.get(t).name)
}

#[test]
fn small_integers_use_the_fixnum_template() {
    let registry = Target::X86_64.template_registry();
    let mut component = increment(Policy::default());

    compile(&mut component, &registry, &PassOptions::default());

    assert_eq!(template_name(&component, "+"), Some("fast-fixnum+"));

    let add = only_call_to(&component, "+");
    let call = component.call(add).unwrap().clone();
    assert_eq!(component.edges[call.callee].convention, Some(Convention::Delayed));
    for arg in call.args.iter().flatten() {
        assert_eq!(component.edges[*arg].convention, Some(Convention::Delayed));
    }

    let output = component.nodes[add].output;
    assert_eq!(component.edges[output].convention, Some(Convention::FixedOne));
    assert!(call.tail);

    assert_valid(&component);
}

#[test]
fn fast_policy_uses_the_unchecked_template() {
    let registry = Target::X86_64.template_registry();
    let mut component = increment(Policy::fast());

    compile(&mut component, &registry, &PassOptions::default());

    assert_eq!(template_name(&component, "+"), Some("unsafe-fixnum+"));
}

#[test]
fn safe_policy_keeps_fast_safe_templates() {
    let registry = Target::X86_64.template_registry();
    let options = PassOptions::default();
    let mut component = increment(Policy::safe().with_speed(2));

    compile(&mut component, &registry, &options);

    assert_eq!(template_name(&component, "+"), Some("fast-fixnum+"));

    let add = only_call_to(&component, "+");
    let mut sink = CollectingSink::default();
    let ctx = CompilationContext::new(&options, &registry, &mut sink);
    let selection = select_template(&component, &ctx, add, InternedSymbol::new("+")).unwrap();

    let unchecked = selection
        .rejected
        .iter()
        .find(|(id, _)| registry.get(*id).name == "unsafe-fixnum+")
        .map(|(_, rejection)| rejection.clone());
    assert_eq!(unchecked, Some(Rejection::Policy(SafetyClass::Fast)));

    // Safe templates are still fine for the entry point's count test
    assert_eq!(template_name(&component, "eq"), Some("if-eq"));

    assert_valid(&component);
}

#[test]
fn unusable_templates_are_listed_in_a_note() {
    let registry = Target::X86_64.template_registry();
    let policy = Policy::safe().with_speed(2).with_inhibit_warnings(0);
    let mut component = typed_unary(
        "wide",
        CType::integer(),
        policy,
        Form::call("+", [Form::var("x"), Form::int(1)]),
    );

    let sink = compile(&mut component, &registry, &PassOptions::default());

    let add = only_call_to(&component, "+");
    assert_eq!(component.call(add).unwrap().kind, CallKind::Full);
    assert_eq!(component.call(add).unwrap().template, None);

    let notes = sink
        .messages(DiagnosticLevel::Note)
        .into_iter()
        .filter(|m| m.starts_with("unable to use any template for +"))
        .collect::<Vec<_>>();
    let [note] = notes[..] else {
        panic!("expected one note, got {notes:?}");
    };
    assert!(
        note.contains("fast-fixnum+ (argument 1 is integer, not fixnum)"),
        "{note}"
    );
    assert!(note.ends_with(" and 1 more"), "{note}");

    assert_valid(&component);
}

#[test]
fn expensive_choices_are_explained() {
    let registry = Target::X86_64.template_registry();
    let policy = Policy::default().with_speed(3).with_inhibit_warnings(0);
    let body = || Form::call("logcount", [Form::var("x")]);

    let mut component = unary("bits", policy, body());
    let sink = compile(&mut component, &registry, &PassOptions::default());

    assert_eq!(template_name(&component, "logcount"), Some("logcount/fixnum"));
    let notes = sink
        .messages(DiagnosticLevel::Note)
        .into_iter()
        .filter(|m| m.starts_with("using"))
        .collect::<Vec<_>>();
    assert_eq!(
        notes,
        vec![
            "using logcount/fixnum (cost 8) since cheaper templates do not apply: \
             popcnt (guard failed)"
        ]
    );

    let options = PassOptions::default().with_features([TargetFeature::Popcnt]);
    let mut component = unary("bits", policy, body());
    let sink = compile(&mut component, &registry, &options);

    assert_eq!(template_name(&component, "logcount"), Some("popcnt"));
    assert!(sink.messages(DiagnosticLevel::Note).iter().all(|m| !m.starts_with("using")));
}

#[test]
fn comparisons_feeding_a_branch_are_fused() {
    let registry = Target::X86_64.template_registry();
    let mut component = Sample::Arithmetic.build(&registry, Policy::default()).unwrap();

    compile(&mut component, &registry, &PassOptions::default());

    assert_eq!(template_name(&component, "<"), Some("fast-if-<"));

    let less = only_call_to(&component, "<");
    let call = component.call(less).unwrap();
    assert!(call.fused_branch);

    let output = component.nodes[less].output;
    assert_eq!(component.edges[output].convention, Some(Convention::Fixed(0)));
    let consumer = component.edges[output].consumer.unwrap();
    assert!(matches!(
        component.nodes[consumer].kind,
        NodeKind::If { test, .. } if test == output
    ));

    for arg in call.args.iter().flatten() {
        assert_eq!(component.edges[*arg].convention, Some(Convention::Delayed));
    }
}

#[test]
fn unknown_value_counts_go_through_the_stack() {
    let registry = Target::X86_64.template_registry();
    let mut component = ComponentBuilder::new("passthrough", &registry)
        .function(FunctionSpec::new("f", &[], Form::call("frob", [])).exported())
        .build()
        .unwrap();

    compile(&mut component, &registry, &PassOptions::default());

    let f = component.function_by_name("f").unwrap();
    let result = component.return_result(f).unwrap();
    assert_eq!(component.edges[result].convention, Some(Convention::Unknown));

    let set = component.tail_set(f).unwrap();
    assert_eq!(component.tail_sets[set].return_type.value_count(), None);

    for producer in &component.edges[result].producers {
        let block = component.nodes[*producer].block;
        assert_eq!(component.blocks[block].pushed, vec![result]);
    }

    let return_node = component.functions[f].return_node.unwrap();
    let block = component.nodes[return_node].block;
    assert_eq!(component.blocks[block].popped, vec![result]);

    assert_valid(&component);
}

#[test]
fn every_edge_gets_a_convention() {
    let registry = Target::X86_64.template_registry();
    let mut component = Sample::HairyCheck.build(&registry, Policy::default()).unwrap();

    compile(&mut component, &registry, &PassOptions::default());

    for node in component.live_nodes() {
        let output = component.nodes[node].output;
        assert!(
            component.edges[output].convention.is_some(),
            "{node:?} delivers {output:?} without a convention"
        );
    }
}
