//! In-process transport, used by tests and embedders driving the kernel
//! directly.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{Endpoints, MessageSink, Request, StdinEvent};
use crate::kernel::error::{KernelError, Result};
use crate::kernel::message::{Channel, Message};

struct MemorySink {
    outgoing: Mutex<Sender<(Channel, Message)>>,
}

impl MessageSink for MemorySink {
    fn send(&self, channel: Channel, msg: &Message) -> Result<()> {
        let outgoing = self.outgoing.lock().unwrap_or_else(|e| e.into_inner());
        outgoing
            .send((channel, msg.clone()))
            .map_err(|_| KernelError::disconnected("frontend dropped"))
    }

    // A single frontend sits on the other end
    fn reply(&self, request: &Request, msg: &Message) -> Result<()> {
        self.send(request.channel, msg)
    }
}

/// Frontend half of an in-memory transport
pub struct MemoryFrontend {
    requests: Sender<Request>,
    stdin: Sender<StdinEvent>,
    outgoing: Receiver<(Channel, Message)>,
}

/// Create a connected kernel/frontend pair
pub fn pair() -> (Endpoints, MemoryFrontend) {
    let (request_tx, request_rx) = mpsc::channel();
    let (stdin_tx, stdin_rx) = mpsc::channel();
    let (out_tx, out_rx) = mpsc::channel();

    let endpoints = Endpoints {
        sink: Arc::new(MemorySink {
            outgoing: Mutex::new(out_tx),
        }),
        requests: request_rx,
        stdin_events: Arc::new(Mutex::new(stdin_rx)),
    };
    let frontend = MemoryFrontend {
        requests: request_tx,
        stdin: stdin_tx,
        outgoing: out_rx,
    };
    (endpoints, frontend)
}

impl MemoryFrontend {
    /// Send a request on shell or control
    pub fn request(&self, channel: Channel, msg: Message) -> Result<()> {
        self.requests
            .send(Request {
                channel,
                origin: 0,
                message: msg,
            })
            .map_err(|_| KernelError::disconnected("kernel stopped"))
    }

    /// Answer an `input_request`
    pub fn reply_stdin(&self, msg: Message) -> Result<()> {
        self.stdin
            .send(StdinEvent::Reply(msg))
            .map_err(|_| KernelError::disconnected("kernel stopped"))
    }

    /// Simulate the frontend closing its stdin connection
    pub fn close_stdin(&self) {
        let _ = self.stdin.send(StdinEvent::Closed);
    }

    /// Next message the kernel sent, waiting at most `timeout`
    pub fn recv_timeout(&self, timeout: Duration) -> Option<(Channel, Message)> {
        match self.outgoing.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Read kernel output until a message of `msg_type` arrives on `channel`;
    /// returns everything read, the match last
    pub fn recv_until(
        &self,
        channel: Channel,
        msg_type: &str,
        timeout: Duration,
    ) -> Vec<(Channel, Message)> {
        let mut seen = Vec::new();
        while let Some((ch, msg)) = self.recv_timeout(timeout) {
            let done = ch == channel && msg.msg_type() == msg_type;
            seen.push((ch, msg));
            if done {
                break;
            }
        }
        seen
    }
}
