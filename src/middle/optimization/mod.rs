pub mod conventions;
pub mod let_conversion;
pub mod local_calls;
pub mod type_checks;
