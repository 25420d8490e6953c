//! Middle tier of a compiler for a dynamically typed language. A front end
//! hands over components of flow graphs with asserted types and a policy on
//! every node; the passes in [`middle`] synthesize type checks, resolve and
//! merge local calls, and pick templates and value conventions for the back
//! end.

pub mod backend;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod index;
pub mod intern;
pub mod middle;
pub mod samples;
