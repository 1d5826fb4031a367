//! # Stepflow Engine
//!
//! The Stepflow engine interprets declarative step workflows: an ordered list
//! of steps, each invoking a named capability with templated arguments. It
//! threads one execution context through the run, supporting conditional
//! skipping, loops, bounded retries, failure tolerance, and `{{ expression }}`
//! templates that reference parameters and earlier step outputs.
//!
//! ## Usage
//!
//! ```rust
//! use stepflow_engine::{CapabilityRegistry, execute};
//! use stepflow_types::CapabilityResult;
//! use serde_json::{Map, Value, json};
//!
//! let mut registry = CapabilityRegistry::new();
//! registry.register_fn("echo", "Return the text argument", |args| {
//!     Ok(CapabilityResult::success(args.get("text").cloned().unwrap_or(Value::Null)))
//! });
//!
//! let document = json!({"steps": [{"id": "a", "tool": "echo", "args": {"text": "hi"}}]});
//! let outcome = execute(&document, &Map::new(), &registry);
//!
//! assert!(outcome.success);
//! assert_eq!(outcome.transcript, vec!["a:echo:hi"]);
//! assert_eq!(outcome.context["steps"]["a"]["output"], "hi");
//! ```
//!
//! ## Architecture
//!
//! - **`resolve`**: execution context, expression resolvers, truthiness
//! - **`templates`**: `{{ ... }}` rendering and unresolved-reference diagnostics
//! - **`executor`**: capability registry, retry policy, and the interpreter
//! - **`workflow`**: operator grammar and workflow file loading
//! - **`session`**: owned session store for session-style capabilities

pub mod executor;
pub mod resolve;
pub mod session;
pub mod templates;
pub mod workflow;

// Re-export commonly used types for convenience
pub use executor::{
    CANCELLED_OUTPUT, COMPLETED_OUTPUT, CancellationFlag, Capability, CapabilityRegistry, ExecutionOptions, FnCapability,
    Interpreter, StepDisposition, StepReport, WorkflowOutcome, execute, parse_delay,
};
pub use resolve::{BasicResolver, ExecutionContext, ExpressionResolver, RichResolver, select_context};
pub use session::{SessionError, SessionHandle, SessionSnapshot, SessionStore};
pub use templates::{render_expression, render_string, render_value};
pub use workflow::condition_syntax::ExpressionError;
pub use workflow::document::{FILE_NOT_FOUND_OUTPUT, WorkflowFile, load_workflow_file, run_workflow_file, validate_workflow_file};
