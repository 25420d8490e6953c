//! Instruction templates: the machine operation patterns the annotator
//! chooses between for each known call, plus the type predicates and check
//! templates the type-check synthesizer prices tests with.

use hashbrown::{HashMap, HashSet};

use crate::{
    backend::targets::TargetFeature,
    index::{IndexVec, simple_index},
    intern::InternedSymbol,
    middle::{
        ctype::{CType, ValuesType},
        flow::Constant,
        policy::SafetyClass,
    },
};

simple_index! {
    /// Identifies a template in a [`TemplateRegistry`]
    pub struct TemplateId;
}

/// What a template requires of one operand or of its result
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Restriction {
    Any,
    Type(CType),
}

impl Restriction {
    pub fn admits(&self, ty: &CType) -> bool {
        match self {
            Restriction::Any => true,
            Restriction::Type(restriction) => ty.is_subtype_of(restriction),
        }
    }
}

impl core::fmt::Display for Restriction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Restriction::Any => write!(f, "t"),
            Restriction::Type(ty) => write!(f, "{ty}"),
        }
    }
}

/// Extra condition on top of operand types
#[derive(Debug, Clone, PartialEq)]
pub enum Guard {
    /// The operand at `index` must be a constant naming exactly this type
    TypeArgument { index: usize, ty: CType },
    /// The target must support the feature
    Feature(TargetFeature),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub name: &'static str,
    /// The known function this template implements
    pub function: InternedSymbol,
    pub args: Vec<Restriction>,
    /// Restriction on any operands past `args`. Without it the operand count
    /// must match exactly.
    pub more_args: Option<Restriction>,
    pub result: Restriction,
    pub cost: u32,
    pub policy: SafetyClass,
    pub guard: Option<Guard>,
    /// Can be fused with a following branch on its result
    pub conditional: bool,
}

/// Why a template could not be used for a call
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    ArgumentCount { expected: usize, found: usize },
    ArgumentType { index: usize, found: CType, wanted: Restriction },
    ResultType { found: CType, wanted: Restriction },
    Guard,
    Policy(SafetyClass),
}

impl core::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::ArgumentCount { expected, found } => {
                write!(f, "takes {expected} arguments, called with {found}")
            }
            Rejection::ArgumentType {
                index,
                found,
                wanted,
            } => write!(f, "argument {} is {found}, not {wanted}", index + 1),
            Rejection::ResultType { found, wanted } => {
                write!(f, "result is {found}, not {wanted}")
            }
            Rejection::Guard => write!(f, "guard failed"),
            Rejection::Policy(policy) => write!(f, "{policy} template disallowed by policy"),
        }
    }
}

/// What a call looks like to template selection
#[derive(Debug, Clone)]
pub struct CallShape<'a> {
    pub args: Vec<CType>,
    /// Constant value of each operand, where it is one
    pub constants: Vec<Option<&'a Constant>>,
    pub result: CType,
}

impl Template {
    /// Checks everything but policy: operand types, result type and guard
    pub fn applies_to(
        &self,
        shape: &CallShape<'_>,
        features: &HashSet<TargetFeature>,
    ) -> Result<(), Rejection> {
        let found = shape.args.len();
        let count_ok = match self.more_args {
            Some(_) => found >= self.args.len(),
            None => found == self.args.len(),
        };

        if !count_ok {
            return Err(Rejection::ArgumentCount {
                expected: self.args.len(),
                found,
            });
        }

        for (index, ty) in shape.args.iter().enumerate() {
            let wanted = match self.args.get(index) {
                Some(restriction) => restriction,
                None => self.more_args.as_ref().unwrap_or(&Restriction::Any),
            };

            if !wanted.admits(ty) {
                return Err(Rejection::ArgumentType {
                    index,
                    found: ty.clone(),
                    wanted: wanted.clone(),
                });
            }
        }

        if !self.result.admits(&shape.result) {
            return Err(Rejection::ResultType {
                found: shape.result.clone(),
                wanted: self.result.clone(),
            });
        }

        let guard_ok = match &self.guard {
            None => true,
            Some(Guard::Feature(feature)) => features.contains(feature),
            Some(Guard::TypeArgument { index, ty }) => matches!(
                shape.constants.get(*index),
                Some(Some(Constant::Type(constant))) if constant.equivalent(ty)
            ),
        };

        if guard_ok { Ok(()) } else { Err(Rejection::Guard) }
    }
}

/// A primitive test for membership in a type
#[derive(Debug, Clone, PartialEq)]
pub struct TypePredicate {
    pub ty: CType,
    pub name: &'static str,
    pub cost: u32,
}

/// Result type of a known function given its argument types
pub type DeriveFn = fn(&[CType]) -> ValuesType;

#[derive(Debug, Clone)]
pub struct KnownFunction {
    pub name: InternedSymbol,
    pub derive: DeriveFn,
}

#[derive(Debug, Default)]
pub struct TemplateRegistry {
    templates: IndexVec<TemplateId, Template>,
    /// Templates of each known function, cheapest first
    by_function: HashMap<InternedSymbol, Vec<TemplateId>>,
    checks: Vec<(CType, TemplateId)>,
    predicates: Vec<TypePredicate>,
    known: HashMap<InternedSymbol, KnownFunction>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_known(&mut self, name: &str, derive: DeriveFn) {
        let name = InternedSymbol::new(name);
        self.known.insert(name, KnownFunction { name, derive });
    }

    pub fn add_template(&mut self, template: Template) -> TemplateId {
        let function = template.function;
        let id = self.templates.push(template);

        let ids = self.by_function.entry(function).or_default();
        ids.push(id);

        let templates = &self.templates;
        ids.sort_by_key(|id| (templates[*id].cost, *id));

        id
    }

    /// Registers the template the back end checks values of `ty` with
    pub fn add_check_template(&mut self, ty: CType, name: &'static str, cost: u32) -> TemplateId {
        let id = self.templates.push(Template {
            name,
            function: InternedSymbol::new("%check-type"),
            args: vec![Restriction::Any],
            more_args: None,
            result: Restriction::Any,
            cost,
            policy: SafetyClass::Safe,
            guard: None,
            conditional: false,
        });

        self.checks.push((ty, id));
        id
    }

    pub fn add_predicate(&mut self, ty: CType, name: &'static str, cost: u32) {
        self.predicates.push(TypePredicate { ty, name, cost });
    }

    pub fn get(&self, id: TemplateId) -> &Template {
        &self.templates[id]
    }

    pub fn templates_for(&self, function: InternedSymbol) -> &[TemplateId] {
        self.by_function
            .get(&function)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn check_template(&self, ty: &CType) -> Option<TemplateId> {
        self.checks
            .iter()
            .find(|(checked, _)| checked.equivalent(ty))
            .map(|(_, id)| *id)
    }

    pub fn predicates(&self) -> &[TypePredicate] {
        &self.predicates
    }

    pub fn predicate_for(&self, ty: &CType) -> Option<&TypePredicate> {
        self.predicates.iter().find(|p| p.ty.equivalent(ty))
    }

    pub fn known(&self, name: InternedSymbol) -> Option<&KnownFunction> {
        self.known.get(&name)
    }

    pub fn is_known(&self, name: InternedSymbol) -> bool {
        self.known.contains_key(&name)
    }
}
