use core::fmt::Write;

use colored::Colorize;
use itertools::Itertools;

use crate::{
    backend::templates::TemplateRegistry,
    index::Index,
    middle::flow::{
        BlockId, CallKind, Component, Constant, Convention, EdgeId, FunctionId, FunctionKind,
        LeafId, LeafKind, NodeId, NodeKind, TypeCheck,
    },
};

/// Renders every live function of the component. Merged functions are shown
/// inside the function they were merged into.
pub fn pretty_print_component(
    component: &Component,
    registry: &TemplateRegistry,
    color: bool,
) -> String {
    let mut out = String::new();

    // Writing into a `String` can not fail
    let _ = write_component(&mut out, component, registry);

    if color {
        out
    } else {
        strip_ansi_escapes::strip_str(out)
    }
}

fn write_component(
    out: &mut String,
    component: &Component,
    registry: &TemplateRegistry,
) -> core::fmt::Result {
    writeln!(out, "{} {}", "component".magenta(), component.name.value().blue())?;

    let roots = component
        .live_functions()
        .filter(|f| component.functions[*f].home.is_none());

    for function in roots {
        write_function(out, component, registry, function)?;
    }

    Ok(())
}

fn write_function(
    out: &mut String,
    component: &Component,
    registry: &TemplateRegistry,
    function: FunctionId,
) -> core::fmt::Result {
    let def = &component.functions[function];

    write!(
        out,
        "{} {}{}",
        "fn".magenta(),
        def.name.value().blue(),
        " (".white()
    )?;
    write!(
        out,
        "{}",
        def.params.iter().map(|p| leaf_name(component, *p)).join(" ").white()
    )?;
    write!(out, "{} {}", ")".white(), kind_name(def.kind).cyan())?;

    if !def.lets.is_empty() {
        write!(
            out,
            " {} {}",
            "lets".cyan(),
            def.lets
                .iter()
                .map(|f| component.functions[*f].name.value())
                .join(" ")
        )?;
    }

    if let Some(set) = component.tail_set(function) {
        let return_type = &component.tail_sets[set].return_type;
        write!(out, " {} {return_type}", "returns".cyan())?;
    }

    writeln!(out)?;

    let blocks = component
        .live_blocks()
        .filter(|b| component.blocks[*b].function == Some(function));

    for block in blocks {
        write_block(out, component, registry, block)?;
    }

    Ok(())
}

fn write_block(
    out: &mut String,
    component: &Component,
    registry: &TemplateRegistry,
    block: BlockId,
) -> core::fmt::Result {
    let data = &component.blocks[block];

    write!(out, "{}", format!("{block}:").bright_red())?;

    if !data.predecessors.is_empty() {
        write!(
            out,
            " {} {}",
            "<-".white(),
            data.predecessors
                .iter()
                .map(|b| block_name(component, *b))
                .join(" ")
        )?;
    }

    if !data.pushed.is_empty() {
        write!(out, " {} {}", "pushes".cyan(), data.pushed.iter().join(" "))?;
    }

    if !data.popped.is_empty() {
        write!(out, " {} {}", "pops".cyan(), data.popped.iter().join(" "))?;
    }

    writeln!(out)?;

    for node in &data.nodes {
        write!(out, "    ")?;
        write_node(out, component, registry, *node)?;
        writeln!(out)?;
    }

    Ok(())
}

fn write_node(
    out: &mut String,
    component: &Component,
    registry: &TemplateRegistry,
    node: NodeId,
) -> core::fmt::Result {
    let data = &component.nodes[node];
    let output = data.output;

    match &data.kind {
        NodeKind::Bind { function, values } => {
            write!(
                out,
                "{} {}",
                "bind".cyan(),
                component.functions[*function].name.value().blue()
            )?;
            if let Some(values) = values {
                write!(out, " {values}")?;
                write_edge_notes(out, component, *values)?;
            }
        }
        NodeKind::Ref { leaf } => {
            write!(
                out,
                "{output} {} {} {}",
                "=".white(),
                "ref".cyan(),
                leaf_name(component, *leaf)
            )?;
            write_edge_notes(out, component, output)?;
        }
        NodeKind::Call(call) => {
            let kind = match call.kind {
                CallKind::Full => "call".to_owned(),
                CallKind::Known(name) => format!("call/known {name}"),
                CallKind::Local => "call/local".to_owned(),
                CallKind::Let => "call/let".to_owned(),
                CallKind::Assignment => "call/assign".to_owned(),
                CallKind::Error => "call/error".to_owned(),
            };

            write!(out, "{output} {} {} {}", "=".white(), kind.cyan(), call.callee)?;

            for arg in &call.args {
                match arg {
                    Some(arg) => write!(out, " {arg}")?,
                    None => write!(out, " {}", "_".white())?,
                }
            }

            if let Some(template) = call.template {
                write!(out, " {} {}", "=>".white(), registry.get(template).name.green())?;
            }
            if call.tail {
                write!(out, " {}", "tail".cyan())?;
            }
            if call.fused_branch {
                write!(out, " {}", "fused".cyan())?;
            }

            write_edge_notes(out, component, output)?;
        }
        NodeKind::If {
            test,
            consequent,
            alternative,
        } => {
            write!(
                out,
                "{} {test} {} {}",
                "if".cyan(),
                consequent.to_string().blue(),
                alternative.to_string().blue()
            )?;
        }
        NodeKind::Set { variable, value } => {
            write!(
                out,
                "{output} {} {} {} {value}",
                "=".white(),
                "set".cyan(),
                leaf_name(component, *variable)
            )?;
        }
        NodeKind::Return { function, result } => {
            write!(
                out,
                "{} {} {result}",
                "return".cyan(),
                component.functions[*function].name.value().blue()
            )?;
            write_edge_notes(out, component, *result)?;
        }
        NodeKind::ErrorStub { message } => {
            write!(out, "{output} {} {} {message:?}", "=".white(), "error".red())?;
        }
    }

    Ok(())
}

/// Type, pending check and convention of an edge
fn write_edge_notes(out: &mut String, component: &Component, edge: EdgeId) -> core::fmt::Result {
    let data = &component.edges[edge];

    if !data.derived.is_wild() {
        write!(out, " {} {}", ":".white(), data.derived.to_string().white())?;
    }

    match &data.check {
        TypeCheck::None | TypeCheck::Dropped => {}
        TypeCheck::Pending => write!(out, " {}", format!("[assert {}]", data.asserted).yellow())?,
        TypeCheck::Simple { types, .. } => write!(
            out,
            " {}",
            format!("[check {}]", types.iter().join(" ")).yellow()
        )?,
        TypeCheck::Resolved => write!(out, " {}", "[checked]".yellow())?,
        TypeCheck::Error => write!(out, " {}", "[type error]".red())?,
    }

    if let Some(convention) = data.convention {
        write!(out, " {}", format!("<{convention}>").purple())?;
    }

    Ok(())
}

fn kind_name(kind: FunctionKind) -> &'static str {
    match kind {
        FunctionKind::Plain => "plain",
        FunctionKind::Let => "let",
        FunctionKind::Assignment => "assignment",
        FunctionKind::Optional => "optional",
        FunctionKind::External => "external",
        FunctionKind::Cleanup => "cleanup",
        FunctionKind::Deleted => "deleted",
    }
}

fn block_name(component: &Component, block: BlockId) -> String {
    if block == component.head {
        "head".to_owned()
    } else {
        block.to_string()
    }
}

fn leaf_name(component: &Component, leaf: LeafId) -> String {
    match &component.leaves[leaf].kind {
        LeafKind::Function(function) => format!("#'{}", component.functions[*function].name),
        LeafKind::Dispatch(dispatch) => format!("#'{}", component.dispatches[*dispatch].name),
        LeafKind::Variable { name, .. } => name.to_string(),
        LeafKind::Global(name) => format!("#'{name}"),
        LeafKind::Constant(constant) => constant.to_string().purple().to_string(),
    }
}

impl core::fmt::Display for Constant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Constant::Integer(value) => write!(f, "{value}"),
            Constant::Float(value) => write!(f, "{value:?}"),
            Constant::Character(value) => write!(f, "#\\{value}"),
            Constant::Symbol(name) => write!(f, "'{name}"),
            Constant::Null => write!(f, "nil"),
            Constant::String(value) => write!(f, "{value:?}"),
            Constant::Type(ty) => write!(f, "'{ty}"),
        }
    }
}

impl core::fmt::Display for Convention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Convention::FixedOne => write!(f, "one"),
            Convention::Fixed(count) => write!(f, "fixed {count}"),
            Convention::Unknown => write!(f, "unknown"),
            Convention::Delayed => write!(f, "delayed"),
        }
    }
}

impl core::fmt::Display for EdgeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", format!("e{}", self.index()).yellow())
    }
}

impl core::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "b{}", self.index())
    }
}

impl core::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.index())
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        backend::targets::Target,
        middle::flow::build::{ComponentBuilder, Form, FunctionSpec},
    };

    #[test]
    fn prints_blocks_in_order() {
        let registry = Target::X86_64.template_registry();
        let component = ComponentBuilder::new("demo", &registry)
            .function(FunctionSpec::new("one", &[], Form::int(1)))
            .build()
            .unwrap();

        assert_eq!(
            pretty_print_component(&component, &registry, false),
            indoc! {"
                component demo
                fn one () plain returns nil
                b2: <- head
                    bind one
                    e2 = ref 1 : (integer 1 1)
                b3: <- b2
                    return one e2 : (integer 1 1)
            "}
        );
    }

    #[test]
    fn color_is_optional() {
        let registry = Target::X86_64.template_registry();
        let component = ComponentBuilder::new("demo", &registry)
            .function(FunctionSpec::new("one", &[], Form::int(1)))
            .build()
            .unwrap();

        let colored = pretty_print_component(&component, &registry, true);
        let plain = pretty_print_component(&component, &registry, false);

        assert_eq!(strip_ansi_escapes::strip_str(colored), plain);
    }
}
