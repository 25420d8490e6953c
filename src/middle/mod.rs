//! The middle tier: three passes over a flow graph that sit between the
//! front end and instruction selection. Type checks are synthesized first,
//! then calls are resolved and single-use functions merged, and finally every
//! edge gets its value convention and every known call its template.

use hashbrown::HashMap;

use crate::{
    backend::templates::TemplateRegistry,
    config::PassOptions,
    diagnostics::{DiagnosticCounts, DiagnosticSink, Diagnostics},
    error::{InternalError, Result},
    intern::InternedSymbol,
    middle::{ctype::CType, flow::Component},
};

pub mod ctype;
pub mod flow;
pub mod optimization;
pub mod policy;

/// State shared by the passes while compiling a batch of components
pub struct CompilationContext<'a> {
    pub options: &'a PassOptions,
    pub registry: &'a TemplateRegistry,
    pub diagnostics: Diagnostics<'a>,
    /// Test cost of each type seen so far. The lattice never changes while
    /// the passes run, so entries stay valid for the whole batch.
    type_costs: HashMap<CType, u32>,
}

impl<'a> CompilationContext<'a> {
    pub fn new(
        options: &'a PassOptions,
        registry: &'a TemplateRegistry,
        sink: &'a mut dyn DiagnosticSink,
    ) -> Self {
        Self {
            options,
            registry,
            diagnostics: Diagnostics::new(sink, options),
            type_costs: HashMap::new(),
        }
    }

    pub(crate) fn cached_cost(&self, ty: &CType) -> Option<u32> {
        self.type_costs.get(ty).copied()
    }

    pub(crate) fn cache_cost(&mut self, ty: CType, cost: u32) {
        self.type_costs.insert(ty, cost);
    }
}

/// What happened to one component of a batch
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentReport {
    pub name: InternedSymbol,
    pub diagnostics: DiagnosticCounts,
    pub outcome: Result<()>,
}

/// Runs all three passes over one component, in order
pub fn compile_component(
    component: &mut Component,
    ctx: &mut CompilationContext,
) -> Result<DiagnosticCounts> {
    let _span = tracing::debug_span!("component", name = %component.name).entered();

    ctx.diagnostics.begin_unit();

    optimization::type_checks::generate_type_checks(component, ctx)?;
    optimization::local_calls::optimize_local_calls(component, ctx)?;
    optimization::conventions::annotate_conventions(component, ctx)?;

    let problems = component.verify();
    if !problems.is_empty() {
        return Err(InternalError::BrokenInvariants(problems));
    }

    Ok(ctx.diagnostics.counts().clone())
}

/// Compiles components one after the other. A broken invariant abandons the
/// component it happened in and compilation moves on to the next one.
pub fn compile_components(
    components: &mut [Component],
    ctx: &mut CompilationContext,
) -> Vec<ComponentReport> {
    components
        .iter_mut()
        .map(|component| {
            let name = component.name;

            match compile_component(component, ctx) {
                Ok(diagnostics) => ComponentReport {
                    name,
                    diagnostics,
                    outcome: Ok(()),
                },
                Err(error) => {
                    tracing::error!(component = %name, %error, "aborted component");

                    ComponentReport {
                        name,
                        diagnostics: ctx.diagnostics.counts().clone(),
                        outcome: Err::<(), InternalError>(error),
                    }
                }
            }
        })
        .collect()
}
