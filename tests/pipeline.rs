mod common;

use pretty_assertions::assert_eq;
use strum::IntoEnumIterator;

use flowmid::{
    backend::{targets::Target, templates::TemplateRegistry},
    config::PassOptions,
    diagnostics::{CollectingSink, DiagnosticLevel},
    error::InternalError,
    middle::{
        CompilationContext, compile_components,
        flow::{CallKind, Component, pretty_print::pretty_print_component},
        policy::Policy,
    },
    samples::Sample,
};

use common::{assert_valid, compile};

/// Every chosen template accepts the operands and result it was chosen for,
/// and is allowed by the node's policy
fn assert_templates_fit(component: &Component, registry: &TemplateRegistry) {
    for node in component.live_nodes() {
        let Some(call) = component.call(node) else { continue };
        let Some(template) = call.template else { continue };
        let template = registry.get(template);

        assert!(matches!(call.kind, CallKind::Known(_)), "{node:?}");
        assert_eq!(Some(template.function), component.callee_name(call));
        assert!(component.nodes[node].policy.bucket().admits(template.policy));

        for (index, arg) in call.args.iter().enumerate() {
            let Some(arg) = arg else { continue };
            let ty = component.edges[*arg].derived.single_value_type();
            let wanted = template
                .args
                .get(index)
                .or(template.more_args.as_ref())
                .unwrap_or_else(|| panic!("{} takes no argument {index}", template.name));

            assert!(wanted.admits(&ty), "{}: argument {index} is {ty}", template.name);
        }

        let result = component.nodes[node].derived.single_value_type();
        assert!(template.result.admits(&result), "{}: result is {result}", template.name);
    }
}

#[test]
fn every_sample_compiles_under_every_policy() {
    let registry = Target::X86_64.template_registry();
    let policies = [Policy::default(), Policy::fast(), Policy::safe()];

    for sample in Sample::iter() {
        for policy in policies {
            let mut component = sample.build(&registry, policy).unwrap();
            compile(&mut component, &registry, &PassOptions::default());

            assert_valid(&component);
            assert_templates_fit(&component, &registry);
        }
    }
}

#[test]
fn merged_graph_prints_let_calls_and_templates() {
    let registry = Target::X86_64.template_registry();
    let mut component = Sample::LetMerge.build(&registry, Policy::default()).unwrap();

    compile(&mut component, &registry, &PassOptions::default());

    let printed = pretty_print_component(&component, &registry, true);
    let plain = strip_ansi_escapes::strip_str(&printed);

    assert!(plain.contains("call/let"), "{plain}");
    assert!(plain.contains("=> fast-fixnum+"), "{plain}");
    assert!(plain.contains("fn outer (x) plain lets helper"), "{plain}");
    assert!(!plain.contains("fn helper"), "{plain}");
}

#[test]
fn batches_report_each_component() {
    let registry = Target::X86_64.template_registry();
    let options = PassOptions::default();
    let mut components = Sample::iter()
        .map(|sample| sample.build(&registry, Policy::default()).unwrap())
        .collect::<Vec<_>>();
    let mut sink = CollectingSink::default();

    let reports = {
        let mut ctx = CompilationContext::new(&options, &registry, &mut sink);
        compile_components(&mut components, &mut ctx)
    };

    let summary = reports
        .iter()
        .map(|r| (r.name.value().to_owned(), r.outcome.is_ok(), r.diagnostics.warnings))
        .collect::<Vec<_>>();
    assert_eq!(
        summary,
        vec![
            ("arithmetic".to_owned(), true, 0),
            ("let-merge".to_owned(), true, 0),
            ("arity-error".to_owned(), true, 1),
            ("hairy-check".to_owned(), true, 0),
            ("keyword-call".to_owned(), true, 1),
            ("assignment-loop".to_owned(), true, 0),
        ]
    );

    let reported = reports.iter().map(|r| r.diagnostics.warnings).sum::<usize>();
    assert_eq!(reported, sink.count(DiagnosticLevel::Warning));
}

#[test]
fn suppressed_warnings_are_not_counted() {
    let registry = Target::X86_64.template_registry();
    let options = PassOptions {
        suppress_warnings: true,
        ..Default::default()
    };
    let mut component = Sample::ArityError.build(&registry, Policy::default()).unwrap();

    let sink = compile(&mut component, &registry, &options);

    assert!(sink.diagnostics.is_empty(), "{:?}", sink.diagnostics);
}

#[test]
fn broken_graphs_abandon_only_their_component() {
    let registry = Target::X86_64.template_registry();
    let options = PassOptions::default();
    let mut components = [Sample::Arithmetic, Sample::LetMerge]
        .map(|sample| sample.build(&registry, Policy::default()).unwrap());

    // A back link with no forward link
    let (head, tail) = (components[0].head, components[0].tail);
    components[0].blocks[head].predecessors.push(tail);

    let mut sink = CollectingSink::default();
    let reports = {
        let mut ctx = CompilationContext::new(&options, &registry, &mut sink);
        compile_components(&mut components, &mut ctx)
    };

    let Err(InternalError::BrokenInvariants(problems)) = &reports[0].outcome else {
        panic!("expected broken invariants, got {:?}", reports[0].outcome);
    };
    assert!(
        problems.iter().any(|p| p.ends_with("is missing its forward link")),
        "{problems:?}"
    );
    assert_eq!(reports[1].outcome, Ok(()));
}
