//! Kernel framework: configuration, messages, transports and the run loop.

pub mod config;
pub mod debugger;
pub mod error;
pub mod history;
pub mod input;
pub mod interpreter;
pub mod message;
pub mod transport;

use serde_json::{Value, json};
use std::sync::Arc;

pub use config::KernelConfig;
pub use error::{KernelError, Result};
pub use interpreter::{
    Completeness, ExecuteOutcome, ExecuteRequest, ExecutionContext, Interpreter, Publisher,
};
pub use message::{Channel, Header, Message};
pub use transport::{Endpoints, Request};

use debugger::{Debugger, DebuggerFactory};
use history::{HistoryManager, HistoryQuery};
use input::{InputChannel, StdinRequester};
use interpreter::IoPublisher;

pub const IMPLEMENTATION: &str = "py-kernel";

/// Name of the user running the kernel, as reported in message headers
pub fn get_user_name() -> String {
    match nix::unistd::User::from_uid(nix::unistd::getuid()) {
        Ok(Some(user)) => user.name,
        _ => std::env::var("USER").unwrap_or_else(|_| "unspecified".to_string()),
    }
}

enum Flow {
    Continue,
    Shutdown,
}

pub struct Kernel {
    config: KernelConfig,
    username: String,
    session: String,
    endpoints: Endpoints,
    interpreter: Box<dyn Interpreter>,
    history: Box<dyn HistoryManager>,
    debugger: Option<Box<dyn Debugger>>,
    execution_count: i64,
}

impl Kernel {
    pub fn new(
        config: KernelConfig,
        username: String,
        endpoints: Endpoints,
        interpreter: Box<dyn Interpreter>,
        history: Box<dyn HistoryManager>,
        debugger_factory: DebuggerFactory,
        debugger_config: Value,
    ) -> Self {
        Self {
            config,
            username,
            session: uuid::Uuid::new_v4().to_string(),
            endpoints,
            interpreter,
            history,
            debugger: debugger_factory(&debugger_config),
            execution_count: 0,
        }
    }

    pub fn get_config(&self) -> &KernelConfig {
        &self.config
    }

    /// Run until shutdown or until the transport closes; returns the exit status
    pub fn start(mut self) -> i32 {
        if let Err(e) = self.interpreter.configure() {
            tracing::error!(error = %e, "interpreter configuration failed");
            return 1;
        }
        tracing::info!(session = %self.session, "kernel started");

        while let Ok(request) = self.endpoints.requests.recv() {
            match self.dispatch(&request) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Shutdown) => {
                    tracing::info!("shutdown requested");
                    return 0;
                }
                Err(e) => {
                    tracing::warn!(msg_type = request.message.msg_type(), error = %e, "request failed");
                }
            }
        }

        tracing::info!("transport closed");
        0
    }

    fn publisher(&self, parent: &Header) -> IoPublisher {
        IoPublisher::new(
            self.endpoints.sink.clone(),
            parent.clone(),
            &self.session,
            &self.username,
        )
    }

    fn reply(&self, request: &Request, content: Value) -> Result<()> {
        let reply = Message::new(
            Header::new(
                &message::reply_type(request.message.msg_type()),
                &self.session,
                &self.username,
            ),
            Some(&request.message.header),
            content,
        );
        self.endpoints.sink.reply(request, &reply)
    }

    fn dispatch(&mut self, envelope: &Request) -> Result<Flow> {
        let request = &envelope.message;
        let status = self.publisher(&request.header);
        status.publish("status", json!({ "execution_state": "busy" }));

        let flow = match request.msg_type() {
            "kernel_info_request" => {
                self.reply(envelope, self.kernel_info())?;
                Ok(Flow::Continue)
            }
            "execute_request" => {
                let content = self.execute(request);
                self.reply(envelope, content)?;
                Ok(Flow::Continue)
            }
            "is_complete_request" => {
                let status = self.interpreter.is_complete(request.content_str("code"));
                self.reply(envelope, json!({ "status": status.as_str() }))?;
                Ok(Flow::Continue)
            }
            "history_request" => {
                let history = match HistoryQuery::from_content(&request.content) {
                    Some(query) => history::entries_to_json(&self.history.query(&query)),
                    None => json!([]),
                };
                self.reply(envelope, json!({ "status": "ok", "history": history }))?;
                Ok(Flow::Continue)
            }
            "debug_request" => {
                let content = match self.debugger.as_mut() {
                    Some(debugger) => debugger.process_request(&request.content),
                    None => json!({
                        "type": "response",
                        "success": false,
                        "message": "debugger not available",
                    }),
                };
                self.reply(envelope, content)?;
                Ok(Flow::Continue)
            }
            "shutdown_request" => {
                let restart = request.content_bool("restart", false);
                self.reply(envelope, json!({ "status": "ok", "restart": restart }))?;
                Ok(Flow::Shutdown)
            }
            other => {
                tracing::warn!(
                    msg_type = other,
                    channel = envelope.channel.name(),
                    "unhandled message type"
                );
                Ok(Flow::Continue)
            }
        };

        status.publish("status", json!({ "execution_state": "idle" }));
        flow
    }

    fn kernel_info(&self) -> Value {
        let mut info = json!({
            "status": "ok",
            "protocol_version": message::PROTOCOL_VERSION,
            "implementation": IMPLEMENTATION,
            "implementation_version": env!("CARGO_PKG_VERSION"),
            "help_links": [],
            "debugger": self.debugger.is_some(),
        });
        if let (Some(info), Value::Object(extra)) = (info.as_object_mut(), self.interpreter.kernel_info()) {
            info.extend(extra);
        }
        info
    }

    fn execute(&mut self, request: &Message) -> Value {
        let execute = ExecuteRequest::from_message(request);
        if execute.store_history {
            self.execution_count += 1;
            self.history.store_input(self.execution_count, &execute.code);
        }

        let publisher: Arc<dyn Publisher> = Arc::new(self.publisher(&request.header));
        if !execute.silent {
            publisher.publish(
                "execute_input",
                json!({ "code": execute.code, "execution_count": self.execution_count }),
            );
        }

        let input = execute.allow_stdin.then(|| {
            Arc::new(StdinRequester::new(
                self.endpoints.sink.clone(),
                self.endpoints.stdin_events.clone(),
                request.header.clone(),
                &self.session,
                &self.username,
            )) as Arc<dyn InputChannel>
        });
        let ctx = ExecutionContext {
            execution_count: self.execution_count,
            publisher: publisher.clone(),
            input,
        };

        match self.interpreter.execute(&execute, &ctx) {
            ExecuteOutcome::Ok => json!({
                "status": "ok",
                "execution_count": self.execution_count,
                "payload": [],
                "user_expressions": {},
            }),
            ExecuteOutcome::Error {
                ename,
                evalue,
                traceback,
            } => {
                let error = json!({ "ename": ename, "evalue": evalue, "traceback": traceback });
                publisher.publish("error", error.clone());
                let mut reply = error;
                reply["status"] = json!("error");
                reply["execution_count"] = json!(self.execution_count);
                reply
            }
        }
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("config", &self.config)
            .field("session", &self.session)
            .field("execution_count", &self.execution_count)
            .finish_non_exhaustive()
    }
}
