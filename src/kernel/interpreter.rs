//! The seam between the kernel run loop and a language interpreter.

use serde_json::{Value, json};
use std::sync::Arc;

use super::input::InputChannel;
use super::message::{Channel, Header, Message};
use super::transport::MessageSink;

/// Parsed `execute_request` content
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteRequest {
    pub code: String,
    pub silent: bool,
    pub store_history: bool,
    pub allow_stdin: bool,
}

impl ExecuteRequest {
    pub fn from_message(msg: &Message) -> Self {
        let silent = msg.content_bool("silent", false);
        Self {
            code: msg.content_str("code").to_string(),
            silent,
            // silent implies no history
            store_history: !silent && msg.content_bool("store_history", true),
            allow_stdin: msg.content_bool("allow_stdin", true),
        }
    }
}

/// Result of running one cell
#[derive(Debug, Clone, PartialEq)]
pub enum ExecuteOutcome {
    Ok,
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
}

/// `is_complete_reply` status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completeness {
    Complete,
    Incomplete,
    Invalid,
    Unknown,
}

impl Completeness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Completeness::Complete => "complete",
            Completeness::Incomplete => "incomplete",
            Completeness::Invalid => "invalid",
            Completeness::Unknown => "unknown",
        }
    }
}

/// Publishes iopub messages on behalf of the current request
pub trait Publisher: Send + Sync {
    fn publish(&self, msg_type: &str, content: Value);
}

/// iopub publisher parented to one request
pub struct IoPublisher {
    sink: Arc<dyn MessageSink>,
    parent: Header,
    session: String,
    username: String,
}

impl IoPublisher {
    pub fn new(sink: Arc<dyn MessageSink>, parent: Header, session: &str, username: &str) -> Self {
        Self {
            sink,
            parent,
            session: session.to_string(),
            username: username.to_string(),
        }
    }
}

impl Publisher for IoPublisher {
    fn publish(&self, msg_type: &str, content: Value) {
        let msg = Message::new(
            Header::new(msg_type, &self.session, &self.username),
            Some(&self.parent),
            content,
        );
        if let Err(e) = self.sink.send(Channel::IoPub, &msg) {
            tracing::warn!(msg_type, error = %e, "iopub publish failed");
        }
    }
}

/// What an interpreter may use while executing one request
pub struct ExecutionContext {
    pub execution_count: i64,
    pub publisher: Arc<dyn Publisher>,
    /// `None` when the request disallows stdin
    pub input: Option<Arc<dyn InputChannel>>,
}

impl ExecutionContext {
    pub fn publish_execution_result(&self, data: Value) {
        self.publisher.publish(
            "execute_result",
            json!({
                "execution_count": self.execution_count,
                "data": data,
                "metadata": {},
            }),
        );
    }

    pub fn publish_stream(&self, name: &str, text: &str) {
        self.publisher
            .publish("stream", json!({ "name": name, "text": text }));
    }
}

/// A language backend driven by the kernel
pub trait Interpreter: Send {
    /// Called once before the run loop starts
    fn configure(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn execute(&mut self, request: &ExecuteRequest, ctx: &ExecutionContext) -> ExecuteOutcome;

    fn is_complete(&mut self, code: &str) -> Completeness;

    /// Language-specific `kernel_info_reply` fields (`language_info`, `banner`)
    fn kernel_info(&self) -> Value;
}
