//! Governed patch application.
//!
//! The primary safety boundary of the engine: a candidate diff from the
//! builder is validated *before* anything touches the working tree:
//! structural parse, truncation-marker scan, and a scope check of every
//! touched path against the phase's declared globs. Application is atomic
//! (checked first, then applied, then committed), returns a commit ref for
//! rollback, and rollback surfaces non-reversible paths as warnings rather
//! than swallowing them.

pub mod apply;
pub mod parse;
pub mod scope;

pub use apply::{AppliedPatch, GitWorkspace, RollbackReport};
pub use parse::{parse_patch, ChangeKind, FileChange, ParsedPatch};
pub use scope::ScopeSet;
