//! Transports carrying kernel messages between the run loop and a frontend.
//!
//! A transport hands the kernel an `Endpoints` bundle: a sink for outgoing
//! messages, a receiver of shell/control requests tagged with the connection
//! they arrived on, and a receiver of stdin events. I/O lives inside the
//! transport; the kernel itself stays single-threaded.

pub mod memory;
pub mod tcp;
pub mod wire;

use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};

use super::error::Result;
use super::message::{Channel, Message};

/// Identifies one frontend connection within a transport
pub type ConnectionId = u64;

/// A shell or control request and where it came from
#[derive(Debug, Clone)]
pub struct Request {
    pub channel: Channel,
    pub origin: ConnectionId,
    pub message: Message,
}

/// Outgoing side of a transport
pub trait MessageSink: Send + Sync {
    /// Broadcast on iopub, or deliver to the frontend currently serving stdin
    fn send(&self, channel: Channel, msg: &Message) -> Result<()>;

    /// Answer a request on the connection it arrived on
    fn reply(&self, request: &Request, msg: &Message) -> Result<()>;
}

/// Events observed on the stdin channel
#[derive(Debug, Clone)]
pub enum StdinEvent {
    Reply(Message),
    Closed,
}

/// Everything the kernel needs from a transport
pub struct Endpoints {
    pub sink: Arc<dyn MessageSink>,
    /// Shell and control requests, in arrival order
    pub requests: Receiver<Request>,
    pub stdin_events: Arc<Mutex<Receiver<StdinEvent>>>,
}

impl std::fmt::Debug for Endpoints {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoints").finish_non_exhaustive()
    }
}
