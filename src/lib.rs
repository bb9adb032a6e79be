extern crate thiserror;

mod raw;
mod runner;
#[cfg(test)]
mod testing;

pub mod arena;
pub mod canonicalize;
pub mod common;
pub mod executable;
pub mod exports;
pub mod image;
pub mod imports;
pub mod interner;
pub mod logging;
pub mod lookup_path;
pub mod models;
pub mod query;
pub mod resources;

pub use canonicalize::{AbsolutePathCanonicalizer, PathCanonicalizer};
pub use common::{decanonicalize, path_to_string, Diagnostic, Diagnostics, FormatError, LookupError, Severity};
pub use executable::{Analysis, CheckReport, Module, ModuleStatus, UnresolvedReason};
pub use lookup_path::LookupPath;
pub use query::{LookupParameters, LookupQuery};

/// Resolve the dependency graph of the roots of a query
///
/// Modules that cannot be located or decoded become unresolved nodes; only an empty query
/// fails the whole run.
pub fn lookup(
    query: &LookupQuery,
    canonicalizer: &dyn PathCanonicalizer,
) -> Result<Analysis, LookupError> {
    let runner = runner::Runner::new(query, LookupPath::new(query), canonicalizer);
    runner.run()
}
