mod common;

use pretty_assertions::assert_eq;

use flowmid::{
    backend::targets::Target,
    config::PassOptions,
    diagnostics::{CollectingSink, DiagnosticLevel},
    middle::{
        CompilationContext,
        ctype::CType,
        flow::{
            CallKind, Component, Constant, FunctionKind, NodeKind, TypeCheck,
            build::{ComponentBuilder, Form, FunctionSpec},
        },
        optimization::type_checks::{CheckStrategy, plan_check, type_test_cost},
        policy::Policy,
    },
};

use common::{asserted_edges, assert_valid, compile, only_call_to};

fn build(policy: Policy, spec: FunctionSpec) -> Component {
    let registry = Target::X86_64.template_registry();

    ComponentBuilder::new("checks", &registry)
        .policy(policy)
        .function(spec.exported())
        .build()
        .unwrap()
}

#[test]
fn operands_of_known_calls_get_check_templates() {
    let registry = Target::X86_64.template_registry();
    let mut component = build(
        Policy::default(),
        FunctionSpec::new(
            "inc",
            &["y"],
            Form::call("+", [Form::the(CType::fixnum(), Form::var("y")), Form::int(1)]),
        ),
    );

    let sink = compile(&mut component, &registry, &PassOptions::default());
    assert!(sink.diagnostics.is_empty(), "{:?}", sink.diagnostics);

    let [edge] = asserted_edges(&component)[..] else {
        panic!("expected one asserted edge");
    };
    let TypeCheck::Simple { types, templates } = &component.edges[edge].check else {
        panic!("expected a simple check, got {:?}", component.edges[edge].check);
    };
    assert_eq!(types, &vec![CType::fixnum()]);
    assert_eq!(templates, &vec![registry.check_template(&CType::fixnum())]);
    assert!(templates[0].is_some());

    // The checked operand is a fixnum, but the sum may overflow
    let add = only_call_to(&component, "+");
    let template = component.call(add).unwrap().template.unwrap();
    assert_eq!(registry.get(template).name, "fixnum+-overflow");
    assert_eq!(sink.count(DiagnosticLevel::Note), 0);
    assert_valid(&component);
}

#[test]
fn checks_for_unknown_callees_are_spliced_in() {
    let registry = Target::X86_64.template_registry();
    let mut component = build(
        Policy::default(),
        FunctionSpec::new(
            "checked",
            &["x"],
            Form::call("frob", [Form::the(CType::fixnum(), Form::var("x"))]),
        ),
    );

    compile(&mut component, &registry, &PassOptions::default());

    let [edge] = asserted_edges(&component)[..] else {
        panic!("expected one asserted edge");
    };
    let data = &component.edges[edge];
    assert_eq!(data.check, TypeCheck::Resolved);
    assert!(data.derived.is_subtype_of(&data.asserted), "{}", data.derived);

    let cleanups = component
        .live_functions()
        .filter(|f| component.functions[*f].kind == FunctionKind::Cleanup)
        .map(|f| component.functions[f].name.value().to_owned())
        .collect::<Vec<_>>();
    assert_eq!(cleanups, vec!["(check checked)".to_owned()]);

    let test = only_call_to(&component, "%typep");
    let call = component.call(test).unwrap();
    assert_eq!(registry.get(call.template.unwrap()).name, "fixnump");
    assert!(call.fused_branch);

    let error = only_call_to(&component, "%type-check-error");
    let block = component.nodes[error].block;
    assert!(component.blocks[block].successors.contains(&component.tail));

    assert_valid(&component);
}

#[test]
fn complement_is_tested_when_it_is_cheaper() {
    let registry = Target::X86_64.template_registry();
    let asserted = CType::int_range(Some(0), Some(9));
    let mut component = build(
        Policy::default(),
        FunctionSpec::new(
            "maybe-digit",
            &["flag"],
            Form::call(
                "frob",
                [Form::the(
                    asserted.clone(),
                    Form::if_(Form::var("flag"), Form::int(5), Form::nil()),
                )],
            ),
        ),
    );

    let [edge] = asserted_edges(&component)[..] else {
        panic!("expected one asserted edge");
    };
    let consumer = component.edges[edge].consumer.unwrap();
    component.rederive(edge);

    {
        let options = PassOptions::default();
        let mut sink = CollectingSink::default();
        let mut ctx = CompilationContext::new(&options, &registry, &mut sink);

        let plan = plan_check(&component, &mut ctx, edge, consumer);
        assert_eq!(plan.strategy, CheckStrategy::Hairy);

        let [Some(test)] = &plan.tests[..] else {
            panic!("expected one test, got {:?}", plan.tests);
        };
        assert!(test.negated);
        assert_eq!(test.ty, CType::null());
        assert_eq!(test.asserted, asserted);
        assert!(type_test_cost(&mut ctx, &test.ty) < type_test_cost(&mut ctx, &asserted));
    }

    compile(&mut component, &registry, &PassOptions::default());

    assert_eq!(component.edges[edge].check, TypeCheck::Resolved);
    assert_eq!(
        component.edges[edge].derived.single_value_type(),
        CType::int_range(Some(5), Some(5))
    );
    assert_valid(&component);
}

#[test]
fn checks_of_unknown_value_counts_are_dropped_with_a_note() {
    let registry = Target::X86_64.template_registry();
    let mut component = build(
        Policy::default(),
        FunctionSpec::new(
            "digit",
            &[],
            Form::the(CType::int_range(Some(0), Some(9)), Form::call("frob", [])),
        ),
    );

    let sink = compile(&mut component, &registry, &PassOptions::default());

    assert_eq!(
        sink.messages(DiagnosticLevel::Note),
        vec!["type assertion too complex to check: (integer 0 9)"]
    );

    let [edge] = asserted_edges(&component)[..] else {
        panic!("expected one asserted edge");
    };
    assert_eq!(component.edges[edge].check, TypeCheck::Dropped);
}

#[test]
fn impossible_assertions_become_error_stubs() {
    let registry = Target::X86_64.template_registry();
    let mut component = build(
        Policy::default(),
        FunctionSpec::new(
            "bad",
            &[],
            Form::call(
                "frob",
                [Form::the(
                    CType::fixnum(),
                    Form::Constant(Constant::String("s".to_owned())),
                )],
            ),
        ),
    );

    let sink = compile(&mut component, &registry, &PassOptions::default());

    assert_eq!(
        sink.messages(DiagnosticLevel::Warning),
        vec!["asserted type fixnum conflicts with derived type string"]
    );

    let [edge] = asserted_edges(&component)[..] else {
        panic!("expected one asserted edge");
    };
    assert_eq!(component.edges[edge].check, TypeCheck::Error);

    let producer = component.sole_producer(edge).unwrap();
    assert!(matches!(component.nodes[producer].kind, NodeKind::ErrorStub { .. }));

    let frob = only_call_to(&component, "frob");
    assert_eq!(component.call(frob).unwrap().kind, CallKind::Error);
}

#[test]
fn zero_safety_drops_checks_silently() {
    let registry = Target::X86_64.template_registry();
    let mut component = build(
        Policy::fast(),
        FunctionSpec::new(
            "trusting",
            &["x"],
            Form::call("frob", [Form::the(CType::fixnum(), Form::var("x"))]),
        ),
    );

    let sink = compile(&mut component, &registry, &PassOptions::default());
    assert!(sink.diagnostics.is_empty(), "{:?}", sink.diagnostics);

    let [edge] = asserted_edges(&component)[..] else {
        panic!("expected one asserted edge");
    };
    assert_eq!(component.edges[edge].check, TypeCheck::Dropped);
    assert!(component.edges[edge].derived.is_subtype_of(&component.edges[edge].asserted));
    assert!(
        component
            .live_functions()
            .all(|f| component.functions[f].kind != FunctionKind::Cleanup)
    );
}
