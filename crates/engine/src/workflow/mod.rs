//! Workflow-level helpers surrounding the interpreter.
//!
//! `condition_syntax` implements the operator grammar used by the rich
//! resolver; `document` loads and validates workflow files from disk.

pub mod condition_syntax;
pub mod document;
