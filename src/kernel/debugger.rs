//! Debugger factory seam.
//!
//! The kernel forwards `debug_request` content to a `Debugger` when the
//! factory produced one; otherwise it answers with an error reply.

use serde_json::Value;

pub trait Debugger: Send {
    /// Handle one debug adapter request and return the response body
    fn process_request(&mut self, request: &Value) -> Value;
}

/// Builds a debugger from its configuration mapping
pub type DebuggerFactory = fn(&Value) -> Option<Box<dyn Debugger>>;
