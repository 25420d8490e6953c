use strum::{Display, EnumIter, EnumString};

use crate::backend::templates::TemplateRegistry;

mod x86_64;

/// Optional instruction set extensions templates may be guarded on
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, clap::ValueEnum,
)]
#[strum(serialize_all = "kebab-case")]
pub enum TargetFeature {
    Popcnt,
    Bmi2,
}

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    X86_64,
}

impl Target {
    /// Templates, type predicates and known functions of the target
    pub fn template_registry(self) -> TemplateRegistry {
        match self {
            Target::X86_64 => x86_64::template_registry(),
        }
    }
}
