//! Reliable channel: ordered payload messages and synced calls over one TCP connection.
//!
//! State machine: Disconnected -> Connecting -> Connected -> Disconnected. The server waits in
//! accept while Connecting; the client dials with backoff. Any I/O or framing fault on a
//! connected link drops back to Disconnected, fails pending calls with `LinkLost`, and goes
//! around again.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use netcore_core::wire::{decode_frame, encode_frame, FrameDecodeError};
use netcore_core::{
    Envelope, Inbound, LinkSpec, NetCoreError, PayloadMessage, PendingCalls, Role,
    SyncedRequest, Value,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::dispatch::Dispatcher;
use crate::unreliable::resolve;
use crate::worker::{self, Worker, JOIN_TIMEOUT};

const CHANNEL: &str = "reliable";
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LinkState {
    Disconnected,
    /// Server: waiting for the peer to connect. Client: dialing.
    Connecting,
    Connected,
}

struct Shared {
    spec: Arc<LinkSpec>,
    /// Server: local bind address. Client: address dialed.
    addr: SocketAddr,
    running: AtomicBool,
    state: Mutex<LinkState>,
    state_changed: Condvar,
    /// Ordered queue into the active connection; `None` while not connected.
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    pending: Arc<PendingCalls>,
    dispatcher: Arc<Dispatcher>,
}

pub struct ReliableChannel {
    shared: Arc<Shared>,
    listener: Mutex<Option<std::net::TcpListener>>,
    worker: Mutex<Option<Worker>>,
}

impl ReliableChannel {
    /// Server: bind the listener now so a taken port is reported. Client: resolve the peer.
    pub fn open(
        spec: Arc<LinkSpec>,
        pending: Arc<PendingCalls>,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self, NetCoreError> {
        let peer = resolve(CHANNEL, &spec.address, spec.reliable_port())?;
        let (addr, listener) = match spec.role {
            Role::Server => {
                let addr = SocketAddr::new(spec.listen_ip(peer.ip()), spec.reliable_port());
                let listener = bind_listener(addr).map_err(|source| NetCoreError::Construction {
                    channel: CHANNEL,
                    target: addr.to_string(),
                    source,
                })?;
                (addr, Some(listener))
            }
            Role::Client => (peer, None),
        };
        Ok(Self {
            shared: Arc::new(Shared {
                spec,
                addr,
                running: AtomicBool::new(false),
                state: Mutex::new(LinkState::Disconnected),
                state_changed: Condvar::new(),
                outbound: Mutex::new(None),
                pending,
                dispatcher,
            }),
            listener: Mutex::new(listener),
            worker: Mutex::new(None),
        })
    }

    /// Spawn the link thread: accept (server) or dial (client), then serve the connection.
    pub fn start(&self) -> Result<(), NetCoreError> {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.is_some() {
            return Ok(());
        }
        let listener = self.listener.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.shared.running.store(true, Ordering::Release);
        let shared = self.shared.clone();
        let name = format!("netcore-tcp-{}", self.shared.spec.role);
        let spawned = Worker::spawn(&name, move |shutdown| link_loop(shared, listener, shutdown))
            .map_err(|source| {
                self.shared.running.store(false, Ordering::Release);
                NetCoreError::Construction {
                    channel: CHANNEL,
                    target: name.clone(),
                    source,
                }
            })?;
        *worker = Some(spawned);
        Ok(())
    }

    /// Queue a payload message on the active connection. No buffering while disconnected.
    pub fn send(&self, msg: PayloadMessage) -> Result<(), NetCoreError> {
        let env = Envelope::try_from(msg)?;
        let frame = encode_frame(&env)?;
        self.shared.send_frame(frame)?;
        trace!("queued {:?}", env.type_tag());
        Ok(())
    }

    /// Send a synced request and block until the peer's return value arrives, the link is
    /// lost, or the configured synced call timeout elapses.
    pub fn send_synced(
        &self,
        type_tag: &str,
        value: Option<Value>,
    ) -> Result<Option<Value>, NetCoreError> {
        if type_tag.is_empty() {
            return Err(NetCoreError::Malformed("empty type tag".into()));
        }
        let pending = &self.shared.pending;
        let call = pending.register();
        let id = call.id();
        let env = Envelope::SyncedRequest {
            correlation_id: id,
            type_tag: type_tag.to_string(),
            value,
        };
        let sent = encode_frame(&env)
            .map_err(NetCoreError::from)
            .and_then(|frame| self.shared.send_frame(frame));
        if let Err(e) = sent {
            pending.cancel(id);
            return Err(e);
        }
        debug!("synced call {type_tag:?} ({id}) sent");
        pending.wait(call, self.shared.spec.synced_call_timeout)
    }

    pub fn state(&self) -> LinkState {
        *self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block until the link reaches `target` or `timeout` elapses. Returns whether it did.
    pub fn wait_for_state(&self, target: LinkState, timeout: Duration) -> bool {
        let state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        let (state, _) = self
            .shared
            .state_changed
            .wait_timeout_while(state, timeout, |s| *s != target)
            .unwrap_or_else(|e| e.into_inner());
        *state == target
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Server: bound address. Client: address dialed.
    pub fn addr(&self) -> SocketAddr {
        self.shared.addr
    }

    /// Clear Running, tear the connection down and release blocked synced callers.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            worker.signal();
        }
        self.shared.detach_connection();
    }

    /// Stop and join the link thread (bounded; detached if stuck).
    pub fn kill(&self) {
        self.stop();
        self.listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            worker.join(JOIN_TIMEOUT);
        }
    }
}

impl Drop for ReliableChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let listener = std::net::TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

impl Shared {
    fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn set_state(&self, state: LinkState) {
        let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *current != state {
            debug!("reliable link {:?} -> {:?}", *current, state);
            *current = state;
            self.state_changed.notify_all();
        }
    }

    fn send_frame(&self, frame: Vec<u8>) -> Result<(), NetCoreError> {
        if !self.running() {
            return Err(NetCoreError::NotConnected);
        }
        let outbound = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        let tx = outbound.as_ref().ok_or(NetCoreError::NotConnected)?;
        tx.send(frame).map_err(|_| NetCoreError::NotConnected)
    }

    fn attach_connection(&self, tx: mpsc::UnboundedSender<Vec<u8>>) {
        *self.outbound.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        self.set_state(LinkState::Connected);
    }

    /// Close the outbound queue first so nothing new can register behind `fail_all`.
    fn detach_connection(&self) {
        self.outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.set_state(LinkState::Disconnected);
        let failed = self.pending.fail_all();
        if failed > 0 {
            info!("released {failed} pending synced call(s) with link lost");
        }
    }

    /// Route one decoded envelope. Replies to synced requests go out on `tx`.
    fn handle(&self, env: Envelope, tx: &mpsc::UnboundedSender<Vec<u8>>) {
        match env {
            Envelope::Payload { type_tag, value } => {
                trace!("payload {type_tag:?}");
                self.dispatcher.dispatch(&mut Inbound::Payload { type_tag, value });
            }
            Envelope::SyncedRequest {
                correlation_id,
                type_tag,
                value,
            } => {
                trace!("synced request {type_tag:?} ({correlation_id})");
                let mut inbound =
                    Inbound::SyncedRequest(SyncedRequest::new(correlation_id, type_tag, value));
                self.dispatcher.dispatch(&mut inbound);
                if let Inbound::SyncedRequest(request) = inbound {
                    self.respond(request, tx);
                }
            }
            Envelope::SyncedResponse {
                correlation_id,
                type_tag,
                value,
            } => {
                if !self.pending.complete(correlation_id, value) {
                    debug!("discarding response {type_tag:?} for stale call {correlation_id}");
                }
            }
        }
    }

    fn respond(&self, request: SyncedRequest, tx: &mpsc::UnboundedSender<Vec<u8>>) {
        let id = request.correlation_id();
        let tag = request.type_tag().to_string();
        let frame = match encode_frame(&request.into_response()) {
            Ok(frame) => frame,
            Err(e) => {
                // Still unblock the caller, without a value.
                warn!("return value for {tag:?} ({id}) not sendable: {e}");
                let empty = Envelope::SyncedResponse {
                    correlation_id: id,
                    type_tag: tag,
                    value: None,
                };
                match encode_frame(&empty) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!("cannot encode empty response: {e}");
                        return;
                    }
                }
            }
        };
        let _ = tx.send(frame);
    }
}

async fn link_loop(
    shared: Arc<Shared>,
    listener: Option<std::net::TcpListener>,
    mut shutdown: watch::Receiver<bool>,
) {
    let listener = match listener.map(TcpListener::from_std).transpose() {
        Ok(l) => l,
        Err(e) => {
            error!("cannot register listener on {}: {e}", shared.addr);
            shared.running.store(false, Ordering::Release);
            return;
        }
    };
    if let Some(l) = &listener {
        info!("waiting for reliable link on {:?}", l.local_addr().ok());
    }
    while shared.running() && !*shutdown.borrow() {
        shared.set_state(LinkState::Connecting);
        let connected = match &listener {
            Some(l) => accept(&shared, l, &mut shutdown).await,
            None => dial(&shared, &mut shutdown).await,
        };
        let Some((stream, peer)) = connected else {
            break;
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay on link to {peer}: {e}");
        }
        info!("reliable link connected to {peer}");
        let result = serve(&shared, stream, &mut shutdown).await;
        shared.detach_connection();
        match result {
            Ok(()) => info!("reliable link to {peer} closed"),
            Err(e) => warn!("reliable link to {peer} lost: {e}"),
        }
    }
    shared.detach_connection();
    debug!("reliable link thread for {} stopped", shared.addr);
}

async fn accept(
    shared: &Shared,
    listener: &TcpListener,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<(TcpStream, SocketAddr)> {
    let backoff = shared.spec.reconnect;
    let mut attempts = 0u32;
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => return None,
            accepted = listener.accept() => match accepted {
                Ok(conn) => return Some(conn),
                Err(e) => {
                    let delay = worker::jittered(backoff.delay(attempts));
                    attempts = attempts.saturating_add(1);
                    warn!("accept on {} failed: {e}; retrying in {delay:?}", shared.addr);
                    if !worker::pause(delay, shutdown).await {
                        return None;
                    }
                }
            },
        }
    }
}

async fn dial(
    shared: &Shared,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<(TcpStream, SocketAddr)> {
    let backoff = shared.spec.reconnect;
    let mut attempts = 0u32;
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => return None,
            connected = TcpStream::connect(shared.addr) => match connected {
                Ok(stream) => return Some((stream, shared.addr)),
                Err(e) => {
                    attempts += 1;
                    if backoff.exhausted(attempts) {
                        error!("giving up on {} after {attempts} attempts: {e}", shared.addr);
                        shared.running.store(false, Ordering::Release);
                        return None;
                    }
                    let delay = worker::jittered(backoff.delay(attempts - 1));
                    debug!("connect to {} failed: {e}; retrying in {delay:?}", shared.addr);
                    if !worker::pause(delay, shutdown).await {
                        return None;
                    }
                }
            },
        }
    }
}

/// Serve one connection until shutdown, peer close, or a fault. Writes run on their own task
/// so a full send buffer never stops this loop from reading.
async fn serve(
    shared: &Shared,
    stream: TcpStream,
    shutdown: &mut watch::Receiver<bool>,
) -> io::Result<()> {
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
    shared.attach_connection(tx.clone());
    let mut writes = tokio::spawn(write_loop(writer, rx));
    let result = read_loop(shared, reader, &tx, &mut writes, shutdown).await;
    writes.abort();
    result
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) -> io::Result<()> {
    while let Some(frame) = rx.recv().await {
        writer.write_all(&frame).await?;
    }
    writer.shutdown().await
}

/// Reads are cancel-safe and accumulate into `buf` until a whole frame is there.
async fn read_loop(
    shared: &Shared,
    mut reader: OwnedReadHalf,
    tx: &mpsc::UnboundedSender<Vec<u8>>,
    writes: &mut JoinHandle<io::Result<()>>,
    shutdown: &mut watch::Receiver<bool>,
) -> io::Result<()> {
    let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => return Ok(()),
            written = &mut *writes => {
                return match written {
                    Ok(result) => result,
                    Err(e) => Err(io::Error::other(e)),
                };
            }
            read = reader.read(&mut chunk) => {
                let n = read?;
                if n == 0 {
                    if buf.is_empty() {
                        return Ok(());
                    }
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed mid-frame",
                    ));
                }
                buf.extend_from_slice(&chunk[..n]);
                let mut consumed = 0;
                loop {
                    match decode_frame(&buf[consumed..]) {
                        Ok((env, used)) => {
                            consumed += used;
                            shared.handle(env, tx);
                        }
                        Err(FrameDecodeError::NeedMore) => break,
                        Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
                    }
                }
                buf.drain(..consumed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netcore_core::Backoff;
    use std::io::Write;
    use std::time::Instant;

    fn channel(port: u16, role: Role, dispatcher: Arc<Dispatcher>) -> ReliableChannel {
        let spec = LinkSpec::loopback(port, role).with_synced_call_timeout(Duration::from_secs(2));
        ReliableChannel::open(Arc::new(spec), Arc::new(PendingCalls::new()), dispatcher).unwrap()
    }

    #[test]
    fn send_while_disconnected_is_rejected() {
        let client = channel(46210, Role::Client, Arc::new(Dispatcher::new()));
        assert_eq!(client.state(), LinkState::Disconnected);
        assert!(matches!(
            client.send(PayloadMessage::new("STATE", None)),
            Err(NetCoreError::NotConnected)
        ));
        assert!(matches!(
            client.send_synced("ADD", None),
            Err(NetCoreError::NotConnected)
        ));
        assert!(client.shared.pending.is_empty());
    }

    #[test]
    fn malformed_synced_message_rejected_before_send() {
        let client = channel(46220, Role::Client, Arc::new(Dispatcher::new()));
        let msg = PayloadMessage {
            type_tag: "ADD".into(),
            value: None,
            correlation_id: None,
            is_synced_call: true,
        };
        assert!(matches!(
            client.send(msg),
            Err(NetCoreError::MissingCorrelationId)
        ));
    }

    #[test]
    fn synced_call_round_trip() {
        let server_d = Arc::new(Dispatcher::new());
        server_d.set_handler(Arc::new(|msg: &mut Inbound| {
            if msg.type_tag() == "ADD" {
                let (a, b): (i32, i32) = msg.decode_value().unwrap().unwrap();
                msg.set_return_value(Value::encode(&(a + b)).unwrap()).unwrap();
            }
        }));
        let server = channel(46230, Role::Server, server_d);
        let client = channel(46230, Role::Client, Arc::new(Dispatcher::new()));
        server.start().unwrap();
        client.start().unwrap();
        assert!(client.wait_for_state(LinkState::Connected, Duration::from_secs(5)));

        let reply = client
            .send_synced("ADD", Some(Value::encode(&(2i32, 3i32)).unwrap()))
            .unwrap()
            .unwrap();
        assert_eq!(reply.decode::<i32>().unwrap(), 5);

        // Nothing set by the handler: the caller still unblocks, with no value.
        assert_eq!(client.send_synced("NOOP", None).unwrap(), None);
        client.kill();
        server.kill();
    }

    #[test]
    fn corrupt_frame_resets_connection_and_client_reconnects() {
        let server = channel(46240, Role::Server, Arc::new(Dispatcher::new()));
        server.start().unwrap();
        let mut raw = std::net::TcpStream::connect(server.addr()).unwrap();
        assert!(server.wait_for_state(LinkState::Connected, Duration::from_secs(5)));
        raw.write_all(&[4, 0, 0, 0, 0xff, 0xff, 0xff, 0xff]).unwrap();
        assert!(server.wait_for_state(LinkState::Connecting, Duration::from_secs(5)));

        // A well-behaved peer can connect again without restarting the server.
        let client = channel(46240, Role::Client, Arc::new(Dispatcher::new()));
        client.start().unwrap();
        assert!(client.wait_for_state(LinkState::Connected, Duration::from_secs(5)));
        assert!(server.wait_for_state(LinkState::Connected, Duration::from_secs(5)));
        client.kill();
        server.kill();
    }

    #[test]
    fn client_gives_up_after_max_attempts() {
        let spec = LinkSpec::loopback(46250, Role::Client).with_reconnect(Backoff {
            initial: Duration::from_millis(5),
            max: Duration::from_millis(10),
            max_attempts: Some(2),
        });
        let client = ReliableChannel::open(
            Arc::new(spec),
            Arc::new(PendingCalls::new()),
            Arc::new(Dispatcher::new()),
        )
        .unwrap();
        client.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while client.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!client.is_running());
        assert!(client.wait_for_state(LinkState::Disconnected, Duration::from_secs(5)));
        client.kill();
    }
}
