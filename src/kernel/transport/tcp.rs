//! Signed newline-delimited JSON over TCP, one listener per channel.
//!
//! Every line is one message in the `wire` encoding; lines whose signature
//! does not match the connection key are dropped. Shell and control replies
//! go back to the connection the request arrived on, iopub broadcasts to
//! every subscriber, stdin requests go to the newest stdin connection and
//! the heartbeat listener echoes each line.
//!
//! I/O runs on a small tokio runtime owned by the sink. The kernel thread
//! only ever enqueues: each connection has a bounded outgoing queue drained
//! by its own writer task, and a connection whose queue is full is dropped.

use futures::StreamExt;
use std::collections::HashMap;
use std::net::TcpListener as StdTcpListener;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;

use super::wire::{self, Signer};
use super::{ConnectionId, Endpoints, MessageSink, Request, StdinEvent};
use crate::kernel::config::{KernelConfig, TransportLimits};
use crate::kernel::error::{KernelError, Result};
use crate::kernel::message::{Channel, Message};

/// The five listening sockets of a kernel.
///
/// Binding happens up front so the ports in `config()` are already owned by
/// this process when they are advertised.
#[derive(Debug)]
pub struct Listeners {
    config: KernelConfig,
    control: StdTcpListener,
    shell: StdTcpListener,
    stdin: StdTcpListener,
    iopub: StdTcpListener,
    hb: StdTcpListener,
}

impl Listeners {
    /// Bind the ports named in `config`. Ports left at 0 are picked by the OS
    /// and written back into the config.
    pub fn bind(mut config: KernelConfig) -> Result<Self> {
        let ip = config.ip.clone();
        let control = bind_one(&ip, &mut config.control_port)?;
        let shell = bind_one(&ip, &mut config.shell_port)?;
        let stdin = bind_one(&ip, &mut config.stdin_port)?;
        let iopub = bind_one(&ip, &mut config.iopub_port)?;
        let hb = bind_one(&ip, &mut config.hb_port)?;
        Ok(Self {
            config,
            control,
            shell,
            stdin,
            iopub,
            hb,
        })
    }

    /// Five OS-assigned ports on `ip` with a fresh key
    pub fn ephemeral(ip: &str) -> Result<Self> {
        Self::bind(KernelConfig::new(ip, [0; 5]))
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }
}

fn bind_one(ip: &str, port: &mut u16) -> Result<StdTcpListener> {
    let listener = StdTcpListener::bind((ip, *port))
        .map_err(|e| KernelError::config(format!("cannot bind {ip}:{port}: {e}")))?;
    *port = listener.local_addr()?.port();
    Ok(listener)
}

/// Time given to writers to flush queued lines when the transport shuts down
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

struct Peer {
    channel: Channel,
    outgoing: mpsc::Sender<Arc<str>>,
    closed: CancellationToken,
    writer: JoinHandle<()>,
}

/// State shared by the sink and the connection tasks
struct Shared {
    signer: Signer,
    limits: TransportLimits,
    next_id: AtomicU64,
    peers: Mutex<HashMap<ConnectionId, Peer>>,
    requests: std_mpsc::Sender<Request>,
    stdin_events: std_mpsc::Sender<StdinEvent>,
}

fn stdin_route(peers: &HashMap<ConnectionId, Peer>) -> Option<ConnectionId> {
    peers
        .iter()
        .filter(|(_, peer)| peer.channel == Channel::Stdin)
        .map(|(id, _)| *id)
        .max()
}

impl Shared {
    fn peers(&self) -> MutexGuard<'_, HashMap<ConnectionId, Peer>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, peer: Peer) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.peers().insert(id, peer);
        id
    }

    /// Forget `id` and close it. Losing the stdin route wakes any pending
    /// input request.
    fn unregister(&self, id: ConnectionId) {
        let mut peers = self.peers();
        let was_stdin_route = stdin_route(&peers) == Some(id);
        if let Some(peer) = peers.remove(&id) {
            peer.closed.cancel();
        }
        drop(peers);

        if was_stdin_route {
            let _ = self.stdin_events.send(StdinEvent::Closed);
        }
    }

    /// Queue `line` for one connection without waiting
    fn push(&self, id: ConnectionId, line: Arc<str>) -> Result<()> {
        let sent = match self.peers().get(&id) {
            Some(peer) => peer.outgoing.try_send(line),
            None => {
                return Err(KernelError::disconnected(format!(
                    "connection {id} is gone"
                )));
            }
        };

        match sent {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::warn!(connection = id, "outgoing queue full, dropping connection");
                self.unregister(id);
                Err(KernelError::disconnected(format!(
                    "connection {id} stopped reading"
                )))
            }
            Err(TrySendError::Closed(_)) => {
                self.unregister(id);
                Err(KernelError::disconnected(format!("connection {id} closed")))
            }
        }
    }

    fn broadcast(&self, line: Arc<str>) {
        let subscribers: Vec<ConnectionId> = self
            .peers()
            .iter()
            .filter(|(_, peer)| peer.channel == Channel::IoPub)
            .map(|(id, _)| *id)
            .collect();
        for id in subscribers {
            let _ = self.push(id, line.clone());
        }
    }

    fn deliver(&self, channel: Channel, origin: ConnectionId, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let message = match wire::decode(&self.signer, line) {
            Ok(message) => message,
            Err(KernelError::InvalidSignature) => {
                tracing::warn!(
                    channel = channel.name(),
                    connection = origin,
                    "dropping message with invalid signature"
                );
                return;
            }
            Err(e) => {
                tracing::warn!(channel = channel.name(), error = %e, "dropping malformed message");
                return;
            }
        };

        match channel {
            Channel::Shell | Channel::Control => {
                let _ = self.requests.send(Request {
                    channel,
                    origin,
                    message,
                });
            }
            Channel::Stdin => {
                let _ = self.stdin_events.send(StdinEvent::Reply(message));
            }
            Channel::IoPub | Channel::Heartbeat => {
                tracing::debug!(channel = channel.name(), "ignoring inbound message");
            }
        }
    }

    #[cfg(test)]
    fn peer_count(&self, channel: Channel) -> usize {
        self.peers()
            .values()
            .filter(|peer| peer.channel == channel)
            .count()
    }
}

struct TcpSink {
    shared: Arc<Shared>,
    runtime: Runtime,
}

impl TcpSink {
    fn encode(&self, msg: &Message) -> Result<Arc<str>> {
        Ok(wire::encode(&self.shared.signer, msg)?.into())
    }
}

impl Drop for TcpSink {
    fn drop(&mut self) {
        // Closing the queues lets each writer flush what is already queued,
        // such as a final shutdown_reply, before the runtime goes away
        let peers = std::mem::take(&mut *self.shared.peers());
        let writers: Vec<JoinHandle<()>> = peers.into_values().map(|peer| peer.writer).collect();
        self.runtime.block_on(async move {
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, futures::future::join_all(writers)).await;
        });
    }
}

impl MessageSink for TcpSink {
    fn send(&self, channel: Channel, msg: &Message) -> Result<()> {
        match channel {
            Channel::IoPub => {
                self.shared.broadcast(self.encode(msg)?);
                Ok(())
            }
            Channel::Stdin => {
                let target = stdin_route(&self.shared.peers())
                    .ok_or_else(|| KernelError::disconnected("no frontend connected on stdin"))?;
                self.shared.push(target, self.encode(msg)?)
            }
            Channel::Shell | Channel::Control => Err(KernelError::protocol(format!(
                "{} messages are replies to a request",
                channel.name()
            ))),
            Channel::Heartbeat => Err(KernelError::protocol("heartbeat carries no messages")),
        }
    }

    fn reply(&self, request: &Request, msg: &Message) -> Result<()> {
        self.shared.push(request.origin, self.encode(msg)?)
    }
}

/// Start serving `listeners`
pub fn serve(listeners: Listeners, limits: TransportLimits) -> Result<Endpoints> {
    start(listeners, limits).map(|(endpoints, _)| endpoints)
}

fn start(listeners: Listeners, limits: TransportLimits) -> Result<(Endpoints, Arc<Shared>)> {
    let Listeners {
        config,
        control,
        shell,
        stdin,
        iopub,
        hb,
    } = listeners;

    let signer = Signer::from_config(&config)?;
    if !signer.is_enabled() {
        tracing::warn!("connection key is empty, messages are not authenticated");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("py-kernel-io")
        .enable_all()
        .build()?;

    let (request_tx, request_rx) = std_mpsc::channel();
    let (stdin_tx, stdin_rx) = std_mpsc::channel();
    let shared = Arc::new(Shared {
        signer,
        limits,
        next_id: AtomicU64::new(1),
        peers: Mutex::default(),
        requests: request_tx,
        stdin_events: stdin_tx,
    });

    {
        let _guard = runtime.enter();
        for (listener, channel) in [
            (shell, Channel::Shell),
            (control, Channel::Control),
            (stdin, Channel::Stdin),
            (iopub, Channel::IoPub),
            (hb, Channel::Heartbeat),
        ] {
            listener.set_nonblocking(true)?;
            let listener = TcpListener::from_std(listener)?;
            runtime.spawn(accept_loop(listener, channel, shared.clone()));
        }
    }

    tracing::info!(ip = %config.ip, shell = config.shell_port, "tcp transport listening");

    let sink = TcpSink {
        shared: shared.clone(),
        runtime,
    };
    let endpoints = Endpoints {
        sink: Arc::new(sink),
        requests: request_rx,
        stdin_events: Arc::new(Mutex::new(stdin_rx)),
    };
    Ok((endpoints, shared))
}

async fn accept_loop(listener: TcpListener, channel: Channel, shared: Arc<Shared>) {
    let permits = Arc::new(Semaphore::new(shared.limits.max_connections));
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(channel = channel.name(), error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let Ok(permit) = permits.clone().try_acquire_owned() else {
            tracing::warn!(
                channel = channel.name(),
                %peer,
                max_connections = shared.limits.max_connections,
                "connection rejected"
            );
            continue;
        };

        let shared = shared.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if channel == Channel::Heartbeat {
                if let Err(e) = echo(stream, &shared.limits).await {
                    tracing::debug!(%peer, error = %e, "heartbeat connection ended");
                }
            } else {
                handle_connection(stream, channel, shared).await;
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, channel: Channel, shared: Arc<Shared>) {
    let (reader, writer) = stream.into_split();
    let mut lines = FramedRead::new(
        reader,
        LinesCodec::new_with_max_length(shared.limits.max_line_bytes),
    );
    let (outgoing, queue) = mpsc::channel(shared.limits.outgoing_capacity);
    let closed = CancellationToken::new();
    let writer = tokio::spawn(write_lines(
        writer,
        queue,
        shared.limits.write_timeout,
        closed.clone(),
    ));
    let id = shared.register(Peer {
        channel,
        outgoing,
        closed: closed.clone(),
        writer,
    });
    tracing::debug!(channel = channel.name(), connection = id, "frontend connected");

    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            line = lines.next() => match line {
                Some(Ok(line)) => shared.deliver(channel, id, &line),
                Some(Err(e)) => {
                    tracing::warn!(channel = channel.name(), connection = id, error = %e, "dropping connection");
                    break;
                }
                None => break,
            },
        }
    }

    shared.unregister(id);
    closed.cancel();
    tracing::debug!(channel = channel.name(), connection = id, "frontend disconnected");
}

async fn write_lines(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::Receiver<Arc<str>>,
    timeout: Duration,
    closed: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            _ = closed.cancelled() => break,
            line = queue.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };
        match tokio::time::timeout(timeout, write_line(&mut writer, &line)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "write failed");
                break;
            }
            Err(_) => {
                tracing::warn!(timeout_secs = timeout.as_secs(), "write timeout, dropping connection");
                break;
            }
        }
    }
    closed.cancel();
}

async fn write_line<W: AsyncWriteExt + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

async fn echo(stream: TcpStream, limits: &TransportLimits) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(limits.max_line_bytes));
    while let Some(line) = lines.next().await {
        let line = line.map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tokio::time::timeout(limits.write_timeout, write_line(&mut writer, &line))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "write timeout"))??;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::message::Header;
    use serde_json::json;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpStream as StdTcpStream;
    use std::time::Instant;

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Harness {
        config: KernelConfig,
        endpoints: Endpoints,
        shared: Arc<Shared>,
        signer: Signer,
    }

    fn harness(limits: TransportLimits) -> Harness {
        let listeners = Listeners::ephemeral("127.0.0.1").unwrap();
        let config = listeners.config().clone();
        let (endpoints, shared) = start(listeners, limits).unwrap();
        let signer = Signer::from_config(&config).unwrap();
        Harness {
            config,
            endpoints,
            shared,
            signer,
        }
    }

    impl Harness {
        fn connect(&self, port: u16) -> Client {
            let stream = StdTcpStream::connect(self.config.address(port)).unwrap();
            stream.set_read_timeout(Some(TIMEOUT)).unwrap();
            Client {
                reader: BufReader::new(stream.try_clone().unwrap()),
                writer: stream,
            }
        }

        fn wait_for_peers(&self, channel: Channel, count: usize) {
            let deadline = Instant::now() + TIMEOUT;
            while self.shared.peer_count(channel) != count {
                assert!(
                    Instant::now() < deadline,
                    "expected {count} {} connections",
                    channel.name()
                );
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }

    struct Client {
        reader: BufReader<StdTcpStream>,
        writer: StdTcpStream,
    }

    impl Client {
        fn send_line(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).unwrap();
            self.writer.write_all(b"\n").unwrap();
        }

        fn send(&mut self, signer: &Signer, msg: &Message) {
            self.send_line(&wire::encode(signer, msg).unwrap());
        }

        fn read_line(&mut self) -> std::io::Result<String> {
            let mut line = String::new();
            self.reader.read_line(&mut line)?;
            Ok(line)
        }

        fn recv(&mut self, signer: &Signer) -> Message {
            let line = self.read_line().unwrap();
            wire::decode(signer, line.trim_end()).unwrap()
        }
    }

    fn message(msg_type: &str, content: serde_json::Value) -> Message {
        Message::new(Header::new(msg_type, "session", "user"), None, content)
    }

    #[test]
    fn ephemeral_listeners_record_their_ports() {
        let listeners = Listeners::ephemeral("127.0.0.1").unwrap();
        let config = listeners.config();
        let mut ports = vec![
            config.control_port,
            config.shell_port,
            config.stdin_port,
            config.iopub_port,
            config.hb_port,
        ];
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 5);
        assert!(ports.iter().all(|p| *p != 0));
        assert_eq!(listeners.shell.local_addr().unwrap().port(), config.shell_port);
    }

    #[test]
    fn occupied_port_is_config_error() {
        let taken = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let err = Listeners::bind(KernelConfig::new("127.0.0.1", [0, port, 0, 0, 0])).unwrap_err();
        assert!(matches!(err, KernelError::Config(_)));
    }

    #[test]
    fn heartbeat_echoes_lines() {
        let h = harness(TransportLimits::default());
        let mut hb = h.connect(h.config.hb_port);
        hb.send_line("ping");
        assert_eq!(hb.read_line().unwrap(), "ping\n");
    }

    #[test]
    fn replies_return_to_the_requesting_connection() {
        let h = harness(TransportLimits::default());
        let mut first = h.connect(h.config.shell_port);
        let mut second = h.connect(h.config.shell_port);
        h.wait_for_peers(Channel::Shell, 2);

        let request = message("kernel_info_request", json!({}));
        second.send(&h.signer, &request);
        let received = h.endpoints.requests.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(received.channel, Channel::Shell);
        assert_eq!(received.message, request);

        let reply = Message::new(
            Header::new("kernel_info_reply", "kernel", "user"),
            Some(&request.header),
            json!({ "status": "ok" }),
        );
        h.endpoints.sink.reply(&received, &reply).unwrap();
        assert_eq!(second.recv(&h.signer), reply);

        first
            .writer
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        assert!(first.read_line().is_err());
    }

    #[test]
    fn unsigned_and_forged_requests_never_reach_the_kernel() {
        let h = harness(TransportLimits::default());
        let mut shell = h.connect(h.config.shell_port);

        let attack = message("execute_request", json!({ "code": "import os" }));
        let unsigned = Signer::new("hmac-sha256", "").unwrap();
        let guessed = Signer::new("hmac-sha256", "guessed-key").unwrap();
        shell.send(&unsigned, &attack);
        shell.send(&guessed, &attack);
        shell.send_line("not json at all");

        let legit = message("kernel_info_request", json!({}));
        shell.send(&h.signer, &legit);

        let received = h.endpoints.requests.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(received.message, legit);
        assert!(
            h.endpoints
                .requests
                .recv_timeout(Duration::from_millis(200))
                .is_err()
        );
    }

    #[test]
    fn stalled_iopub_subscriber_is_dropped_without_blocking_publishers() {
        let h = harness(TransportLimits {
            outgoing_capacity: 8,
            ..TransportLimits::default()
        });
        let _stalled = h.connect(h.config.iopub_port);
        h.wait_for_peers(Channel::IoPub, 1);

        let chunk = "x".repeat(64 * 1024);
        let started = Instant::now();
        for _ in 0..400 {
            let stream = message("stream", json!({ "name": "stdout", "text": chunk }));
            h.endpoints.sink.send(Channel::IoPub, &stream).unwrap();
        }
        assert!(started.elapsed() < TIMEOUT);
        h.wait_for_peers(Channel::IoPub, 0);
    }

    #[test]
    fn stdin_follows_the_newest_connection_across_reconnects() {
        let h = harness(TransportLimits::default());
        let old = h.connect(h.config.stdin_port);
        h.wait_for_peers(Channel::Stdin, 1);
        let mut new = h.connect(h.config.stdin_port);
        h.wait_for_peers(Channel::Stdin, 2);

        drop(old);
        h.wait_for_peers(Channel::Stdin, 1);
        // The older connection was not serving stdin, so nothing is woken
        assert!(h.endpoints.stdin_events.lock().unwrap().try_recv().is_err());

        let request = message("input_request", json!({ "prompt": "", "password": false }));
        h.endpoints.sink.send(Channel::Stdin, &request).unwrap();
        assert_eq!(new.recv(&h.signer), request);
    }

    #[test]
    fn losing_the_stdin_frontend_reports_closed() {
        let h = harness(TransportLimits::default());
        let request = message("input_request", json!({ "prompt": "", "password": false }));
        let err = h.endpoints.sink.send(Channel::Stdin, &request).unwrap_err();
        assert!(matches!(err, KernelError::Disconnected(_)));

        let stdin = h.connect(h.config.stdin_port);
        h.wait_for_peers(Channel::Stdin, 1);
        drop(stdin);

        let event = h
            .endpoints
            .stdin_events
            .lock()
            .unwrap()
            .recv_timeout(TIMEOUT)
            .unwrap();
        assert!(matches!(event, StdinEvent::Closed));
        assert!(h.endpoints.sink.send(Channel::Stdin, &request).is_err());
    }

    #[test]
    fn overlong_line_drops_the_connection() {
        let h = harness(TransportLimits {
            max_line_bytes: 1024,
            ..TransportLimits::default()
        });
        let mut shell = h.connect(h.config.shell_port);
        h.wait_for_peers(Channel::Shell, 1);

        shell.writer.write_all(&[b'x'; 4096]).unwrap();
        h.wait_for_peers(Channel::Shell, 0);
        assert!(matches!(shell.read_line().as_deref(), Ok("") | Err(_)));
        assert!(h.endpoints.requests.try_recv().is_err());
    }

    #[test]
    fn shell_send_without_request_is_protocol_error() {
        let h = harness(TransportLimits::default());
        let msg = message("status", json!({}));
        let err = h.endpoints.sink.send(Channel::Shell, &msg).unwrap_err();
        assert!(matches!(err, KernelError::Protocol(_)));
    }
}
