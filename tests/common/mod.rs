#![allow(dead_code)]

use flowmid::{
    backend::templates::TemplateRegistry,
    config::PassOptions,
    diagnostics::CollectingSink,
    middle::{
        CompilationContext, compile_component,
        flow::{Component, EdgeId, NodeId, TypeCheck},
    },
};

/// Runs every pass over the component and returns what was reported
pub fn compile(
    component: &mut Component,
    registry: &TemplateRegistry,
    options: &PassOptions,
) -> CollectingSink {
    let mut sink = CollectingSink::default();

    {
        let mut ctx = CompilationContext::new(options, registry, &mut sink);
        compile_component(component, &mut ctx).unwrap();
    }

    sink
}

/// Live call nodes whose callee is named `name`
pub fn calls_to(component: &Component, name: &str) -> Vec<NodeId> {
    component
        .live_nodes()
        .filter(|n| {
            component
                .call(*n)
                .and_then(|call| component.callee_name(call))
                .is_some_and(|callee| callee.value() == name)
        })
        .collect()
}

pub fn only_call_to(component: &Component, name: &str) -> NodeId {
    let calls = calls_to(component, name);
    assert_eq!(calls.len(), 1, "expected one call to {name}");
    calls[0]
}

/// Edges that had a type asserted on them when the component was built
pub fn asserted_edges(component: &Component) -> Vec<EdgeId> {
    component
        .edges
        .enumerate()
        .filter(|(_, e)| e.check != TypeCheck::None)
        .map(|(id, _)| id)
        .collect()
}

pub fn assert_valid(component: &Component) {
    let problems = component.verify();
    assert!(problems.is_empty(), "{problems:#?}");
}
