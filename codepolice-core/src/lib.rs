//! Domain logic for the codepolice analyze-and-fix pipeline.
//!
//! This crate is deliberately free of I/O. It holds:
//! - the data model shared between the server and its persistence layer
//!   ([`issue`]),
//! - the strict parse-then-validate boundary for LLM responses ([`parse`]),
//! - the fix-consolidation algorithm ([`consolidate`]),
//! - import-declaration scanning for building analysis contexts ([`imports`]),
//! - deterministic rendering of branch names, commit messages, and PR/email
//!   bodies ([`render`]).

pub mod consolidate;
pub mod imports;
pub mod issue;
pub mod parse;
pub mod render;

pub use consolidate::*;
pub use issue::*;
pub use parse::{parse_fix_response, parse_issue_response, ParseOutcome, ParsedIssue};
