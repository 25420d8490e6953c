//! Small components the driver can compile without a front end. Each one
//! exercises a different part of the passes.

use strum::{Display, EnumIter, EnumString};

use crate::{
    backend::templates::TemplateRegistry,
    error::Result,
    middle::{
        ctype::CType,
        flow::{
            Component, Constant,
            build::{ComponentBuilder, Form, FunctionSpec},
        },
        policy::Policy,
    },
};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, clap::ValueEnum,
)]
#[strum(serialize_all = "kebab-case")]
pub enum Sample {
    /// Small integer arithmetic and a comparison feeding a branch
    Arithmetic,
    /// A helper with a single caller
    LetMerge,
    /// A call with the wrong number of arguments
    ArityError,
    /// Checks the consumer does not do itself, and ones it does
    HairyCheck,
    /// Calls to a function with keyword parameters
    KeywordCall,
    /// A self tail recursive loop with one outside caller
    AssignmentLoop,
}

impl Sample {
    pub fn description(self) -> &'static str {
        match self {
            Sample::Arithmetic => "small integer arithmetic and a fused comparison",
            Sample::LetMerge => "a helper merged into its only caller",
            Sample::ArityError => "a call with the wrong number of arguments",
            Sample::HairyCheck => "type checks spliced in and left to the back end",
            Sample::KeywordCall => "keyword arguments resolved at compile time",
            Sample::AssignmentLoop => "a tail recursive loop turned into a jump",
        }
    }

    pub fn build(self, registry: &TemplateRegistry, policy: Policy) -> Result<Component> {
        let builder = ComponentBuilder::new(&self.to_string(), registry).policy(policy);
        let small = CType::int_range(Some(0), Some(100));

        let builder = match self {
            Sample::Arithmetic => builder.function(
                FunctionSpec::new(
                    "distance",
                    &["a", "b"],
                    Form::if_(
                        Form::call("<", [Form::var("a"), Form::var("b")]),
                        Form::call("-", [Form::var("b"), Form::var("a")]),
                        Form::call("-", [Form::var("a"), Form::var("b")]),
                    ),
                )
                .param_type("a", small.clone())
                .param_type("b", small)
                .exported(),
            ),
            Sample::LetMerge => builder
                .function(
                    FunctionSpec::new(
                        "outer",
                        &["x"],
                        Form::call("*", [Form::call("helper", [Form::var("x")]), Form::int(2)]),
                    )
                    .param_type("x", small)
                    .exported(),
                )
                .function(
                    FunctionSpec::new(
                        "helper",
                        &["y"],
                        Form::call("+", [Form::var("y"), Form::int(1)]),
                    )
                    .param_type("y", CType::int_range(Some(0), Some(100))),
                ),
            Sample::ArityError => builder
                .function(
                    FunctionSpec::new(
                        "caller",
                        &[],
                        Form::call("pair", [Form::int(1), Form::int(2), Form::int(3)]),
                    )
                    .exported(),
                )
                .function(FunctionSpec::new(
                    "pair",
                    &["a", "b"],
                    Form::call("+", [Form::var("a"), Form::var("b")]),
                )),
            Sample::HairyCheck => builder.function(
                FunctionSpec::new(
                    "checked",
                    &["x", "y"],
                    Form::progn([
                        Form::call("frob", [Form::the(CType::fixnum(), Form::var("x"))]),
                        Form::call("+", [Form::the(CType::fixnum(), Form::var("y")), Form::int(1)]),
                    ]),
                )
                .exported(),
            ),
            Sample::KeywordCall => builder
                .function(
                    FunctionSpec::new(
                        "make-point",
                        &[],
                        Form::call("+", [Form::var("x"), Form::var("y")]),
                    )
                    .key("x", Constant::Integer(0))
                    .key("y", Constant::Integer(0)),
                )
                .function(
                    FunctionSpec::new(
                        "use-points",
                        &[],
                        Form::progn([
                            Form::call("make-point", [Form::keyword("y"), Form::int(2)]),
                            Form::call("make-point", [Form::keyword("z"), Form::int(3)]),
                        ]),
                    )
                    .exported(),
                ),
            Sample::AssignmentLoop => builder
                .function(
                    FunctionSpec::new(
                        "count-down",
                        &["n"],
                        Form::call("countdown-loop", [Form::var("n"), Form::int(0)]),
                    )
                    .param_type("n", CType::fixnum())
                    .exported(),
                )
                .function(
                    FunctionSpec::new(
                        "countdown-loop",
                        &["i", "acc"],
                        Form::if_(
                            Form::call("=", [Form::var("i"), Form::int(0)]),
                            Form::var("acc"),
                            Form::call(
                                "countdown-loop",
                                [
                                    Form::call("-", [Form::var("i"), Form::int(1)]),
                                    Form::call("+", [Form::var("acc"), Form::int(1)]),
                                ],
                            ),
                        ),
                    )
                    .param_type("i", CType::fixnum())
                    .param_type("acc", CType::fixnum()),
                ),
        };

        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;
    use crate::backend::targets::Target;

    #[test]
    fn every_sample_builds_a_valid_graph() {
        let registry = Target::X86_64.template_registry();

        for sample in Sample::iter() {
            let component = sample.build(&registry, Policy::default()).unwrap();

            assert_eq!(component.name.value(), sample.to_string());
            assert!(component.verify().is_empty(), "{sample}: {:?}", component.verify());
        }
    }

    #[test]
    fn names_are_kebab_case() {
        assert_eq!(Sample::AssignmentLoop.to_string(), "assignment-loop");
        assert_eq!("let-merge".parse::<Sample>().unwrap(), Sample::LetMerge);
    }
}
