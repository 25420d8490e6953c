//! Merging functions into their only caller. A function with one reference
//! that is a local call is spliced in at the call ("let" conversion). A
//! function whose other references are all self tail calls can be merged the
//! same way once those calls are turned into jumps back to its entry
//! ("assignment" conversion). A function nothing else references is
//! deleted.

use crate::{
    diagnostics::DiagnosticContext,
    error::{InternalError, Result},
    middle::{
        CompilationContext,
        flow::{CallKind, Component, FunctionId, FunctionKind, NodeId},
    },
};

/// Tries every conversion on the function. Returns whether it was merged
/// or deleted.
pub fn maybe_convert(
    component: &mut Component,
    ctx: &mut CompilationContext,
    function: FunctionId,
) -> Result<bool> {
    let def = &component.functions[function];
    if def.kind != FunctionKind::Plain || def.external_entry.is_some() || def.exported {
        return Ok(false);
    }

    let refs = component.leaves[def.leaf]
        .refs
        .iter()
        .copied()
        .filter(|r| !component.nodes[*r].deleted)
        .collect::<Vec<_>>();

    let (own, outside): (Vec<NodeId>, Vec<NodeId>) = refs
        .iter()
        .copied()
        .partition(|r| component.home(*r) == Some(function));

    if outside.is_empty() {
        delete_function(component, ctx, function);
        return Ok(true);
    }

    let Some(calls) = refs
        .iter()
        .map(|r| local_call_of(component, *r))
        .collect::<Option<Vec<_>>>()
    else {
        return Ok(false);
    };

    if let [call] = calls.as_slice() {
        let_convert(component, function, *call)?;
        return Ok(true);
    }

    let [outside] = outside.as_slice() else {
        return Ok(false);
    };

    let result = component.return_result(function);
    let self_calls = own
        .iter()
        .filter_map(|r| local_call_of(component, *r))
        .collect::<Vec<_>>();
    let all_tail = self_calls
        .iter()
        .all(|c| result.is_some() && Some(component.nodes[*c].output) == result);

    if !all_tail {
        return Ok(false);
    }

    let outside_call =
        local_call_of(component, *outside).ok_or(InternalError::NotACall(*outside))?;
    assignment_convert(component, function, &self_calls, outside_call)?;

    Ok(true)
}

/// The local call `reference` is the callee of, if any
fn local_call_of(component: &Component, reference: NodeId) -> Option<NodeId> {
    let output = component.nodes[reference].output;
    let consumer = component.edges[output].consumer?;
    let call = component.call(consumer)?;

    (call.callee == output && call.kind == CallKind::Local).then_some(consumer)
}

/// Splices the body of `function` in at `call`: the call's arguments flow
/// into the function's entry and its returns flow to where the call's value
/// used to go
pub fn let_convert(component: &mut Component, function: FunctionId, call: NodeId) -> Result<()> {
    let home = component.home(call).ok_or(InternalError::NotACall(call))?;
    let entry = component.functions[function].entry;
    let entry_edge = component.blocks[entry]
        .start
        .ok_or(InternalError::MissingBind(function))?;

    let output = component.nodes[call].output;
    let after = component.ensure_block_start(output)?;
    let call_block = component.nodes[call].block;

    component.unlink_blocks(call_block, after);
    component.link_blocks(call_block, entry);
    component.set_output(call, entry_edge);

    let return_node = component.functions[function].return_node;
    if let (Some(result), Some(return_node)) = (component.return_result(function), return_node) {
        let return_block = component.nodes[return_node].block;

        let tail = component.return_result(home) == Some(output);
        let moved = component.move_producers(result, output);

        // Calls that were tail calls of the merged function are tail calls
        // of the caller only if the call being replaced was one
        for producer in moved {
            let allowed = component.nodes[producer].policy.allows_tail_calls();
            if let Some(call) = component.call_mut(producer) {
                call.tail = tail && allowed;
            }
        }

        component.delete_block(return_block);
        component.functions[function].return_node = None;
    }

    let owned = component
        .blocks
        .indices()
        .filter(|b| component.blocks[*b].function == Some(function))
        .collect::<Vec<_>>();
    for block in owned {
        component.blocks[block].function = Some(home);
    }

    let nested = std::mem::take(&mut component.functions[function].lets);
    for merged in &nested {
        component.functions[*merged].home = Some(home);
    }

    let def = &mut component.functions[function];
    def.kind = FunctionKind::Let;
    def.home = Some(home);

    let home_def = &mut component.functions[home];
    home_def.lets.push(function);
    home_def.lets.extend(nested);

    leave_tail_set(component, function);

    let head = component.head;
    component.unlink_blocks(head, entry);

    if let Some(call) = component.call_mut(call) {
        call.kind = CallKind::Let;
        call.tail = false;
    }

    tracing::debug!(
        function = %component.functions[function].name,
        into = %component.functions[home].name,
        "let converted"
    );

    Ok(())
}

/// Turns the self tail calls into jumps to the entry, then merges the
/// function into its one outside caller
fn assignment_convert(
    component: &mut Component,
    function: FunctionId,
    self_calls: &[NodeId],
    outside: NodeId,
) -> Result<()> {
    let entry = component.functions[function].entry;
    let entry_edge = component.blocks[entry]
        .start
        .ok_or(InternalError::MissingBind(function))?;
    let return_block = component.functions[function]
        .return_node
        .map(|node| component.nodes[node].block)
        .ok_or(InternalError::MissingBind(function))?;

    for call in self_calls {
        let block = component.nodes[*call].block;

        component.unlink_blocks(block, return_block);
        component.link_blocks(block, entry);
        component.set_output(*call, entry_edge);

        if let Some(call) = component.call_mut(*call) {
            call.kind = CallKind::Assignment;
            call.tail = false;
        }
    }

    let_convert(component, function, outside)?;
    component.functions[function].kind = FunctionKind::Assignment;

    tracing::debug!(
        function = %component.functions[function].name,
        self_calls = self_calls.len(),
        "assignment converted"
    );

    Ok(())
}

/// Deletes a function nothing outside of it references. Functions it
/// referenced are queued again since they lost a reference.
fn delete_function(component: &mut Component, ctx: &mut CompilationContext, function: FunctionId) {
    let def = &component.functions[function];
    let policy = component.nodes[def.bind].policy;
    let name = def.name;

    ctx.diagnostics.note(
        &policy,
        DiagnosticContext::new(Some(name), "call-graph optimization"),
        format!("deleting unused function {name}"),
    );

    let blocks = component
        .live_blocks()
        .filter(|b| component.blocks[*b].function == Some(function))
        .collect::<Vec<_>>();
    for block in blocks {
        component.delete_block(block);
    }

    let merged = component.functions[function].lets.clone();
    for function in merged.into_iter().chain([function]) {
        component.functions[function].kind = FunctionKind::Deleted;
        leave_tail_set(component, function);
    }

    tracing::debug!(%name, "deleted function");
}

fn leave_tail_set(component: &mut Component, function: FunctionId) {
    if let Some(set) = component.tail_set(function) {
        component.tail_sets[set].functions.retain(|f| *f != function);
    }

    component.functions[function].tail_set = None;
}
