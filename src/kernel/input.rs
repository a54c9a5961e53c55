//! Blocking input requests over the stdin channel.

use serde_json::{Value, json};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};

use super::error::{KernelError, Result};
use super::message::{Channel, Header, Message};
use super::transport::{MessageSink, StdinEvent};

/// Capability to ask the frontend for a line of input
pub trait InputChannel: Send + Sync {
    /// Block until the frontend answers; `password` asks it to mask the input
    fn request_input(&self, prompt: &str, password: bool) -> Result<String>;
}

/// `InputChannel` bound to one execute request
pub struct StdinRequester {
    sink: Arc<dyn MessageSink>,
    events: Arc<Mutex<Receiver<StdinEvent>>>,
    parent: Header,
    session: String,
    username: String,
}

impl StdinRequester {
    pub fn new(
        sink: Arc<dyn MessageSink>,
        events: Arc<Mutex<Receiver<StdinEvent>>>,
        parent: Header,
        session: &str,
        username: &str,
    ) -> Self {
        Self {
            sink,
            events,
            parent,
            session: session.to_string(),
            username: username.to_string(),
        }
    }
}

impl InputChannel for StdinRequester {
    fn request_input(&self, prompt: &str, password: bool) -> Result<String> {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());

        // Replies left over from an earlier, abandoned request
        while let Ok(stale) = events.try_recv() {
            tracing::debug!(?stale, "discarding stale stdin event");
        }

        let request = Message::new(
            Header::new("input_request", &self.session, &self.username),
            Some(&self.parent),
            json!({ "prompt": prompt, "password": password }),
        );
        self.sink.send(Channel::Stdin, &request)?;

        loop {
            match events.recv() {
                Ok(StdinEvent::Reply(reply)) if reply.msg_type() == "input_reply" => {
                    return Ok(reply
                        .content
                        .get("value")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string());
                }
                Ok(StdinEvent::Reply(other)) => {
                    tracing::warn!(msg_type = other.msg_type(), "unexpected message on stdin");
                }
                Ok(StdinEvent::Closed) | Err(_) => {
                    return Err(KernelError::disconnected("stdin closed while waiting for input"));
                }
            }
        }
    }
}
