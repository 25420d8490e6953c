//! What the middle passes need to know about the back end: the templates it
//! can generate code from, the type tests it can do cheaply and the known
//! functions it implements directly.

pub mod targets;
pub mod templates;
