//! Unreliable channel: best-effort notifications over UDP between the two fixed endpoints
//! implied by the link spec. The listener rebinds itself after receive faults.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, info, trace, warn};
use netcore_core::{Inbound, LinkSpec, NetCoreError, Notification};
use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::dispatch::Dispatcher;
use crate::worker::{self, Worker, JOIN_TIMEOUT};

const CHANNEL: &str = "unreliable";
const RECV_BUF_SIZE: usize = 65_536;

struct Shared {
    spec: Arc<LinkSpec>,
    /// Where notifications are sent.
    peer: SocketAddr,
    /// Where notifications are received.
    listen: SocketAddr,
    running: AtomicBool,
    /// Successful rebinds after a receive fault.
    rebinds: AtomicUsize,
    sender: Mutex<Option<std::net::UdpSocket>>,
    dispatcher: Arc<Dispatcher>,
    #[cfg(test)]
    fail_next_recv: AtomicBool,
}

pub struct UnreliableChannel {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl UnreliableChannel {
    /// Resolve the peer and open the outbound socket. Fails fast; nothing is listening yet.
    pub fn open(spec: Arc<LinkSpec>, dispatcher: Arc<Dispatcher>) -> Result<Self, NetCoreError> {
        let peer = resolve(CHANNEL, &spec.address, spec.unreliable_send_port())?;
        let listen = SocketAddr::new(spec.listen_ip(peer.ip()), spec.unreliable_listen_port());
        let local = SocketAddr::new(spec.listen_ip(peer.ip()), 0);
        let sender = std::net::UdpSocket::bind(local).map_err(|source| {
            NetCoreError::Construction {
                channel: CHANNEL,
                target: local.to_string(),
                source,
            }
        })?;
        debug!("notification sender bound to {:?}, peer {peer}", sender.local_addr().ok());
        Ok(Self {
            shared: Arc::new(Shared {
                spec,
                peer,
                listen,
                running: AtomicBool::new(false),
                rebinds: AtomicUsize::new(0),
                sender: Mutex::new(Some(sender)),
                dispatcher,
                #[cfg(test)]
                fail_next_recv: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        })
    }

    /// Bind the receive socket and spawn the listener thread. The first bind happens here so
    /// a taken port is reported to the caller.
    pub fn start(&self) -> Result<(), NetCoreError> {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.is_some() {
            return Ok(());
        }
        let socket = bind_listener(self.shared.listen).map_err(|source| {
            NetCoreError::Construction {
                channel: CHANNEL,
                target: self.shared.listen.to_string(),
                source,
            }
        })?;
        self.shared.running.store(true, Ordering::Release);
        let shared = self.shared.clone();
        let name = format!("netcore-udp-{}", self.shared.spec.role);
        let spawned = Worker::spawn(&name, move |shutdown| listen_loop(shared, socket, shutdown))
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

    /// Send one datagram, best-effort. Dropped silently when not running; socket errors are
    /// logged, not returned. Only an unencodable tag is an error.
    pub fn send(&self, notification: &Notification) -> Result<(), NetCoreError> {
        let bytes = notification.encode()?;
        if !self.is_running() {
            trace!("not running, dropping notification {:?}", notification.type_tag);
            return Ok(());
        }
        let sender = self.shared.sender.lock().unwrap_or_else(|e| e.into_inner());
        let Some(socket) = sender.as_ref() else {
            return Ok(());
        };
        match socket.send_to(bytes, self.shared.peer) {
            Ok(_) => trace!(
                "sent notification {:?} to {}",
                notification.type_tag, self.shared.peer
            ),
            Err(e) => warn!(
                "failed to send notification {:?} to {}: {e}",
                notification.type_tag, self.shared.peer
            ),
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.shared.listen
    }

    /// Clear Running; the listener exits without rebinding.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            worker.signal();
        }
    }

    /// Stop, close the sender and join the listener thread (bounded; detached if stuck).
    pub fn kill(&self) {
        self.stop();
        self.shared
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            worker.join(JOIN_TIMEOUT);
        }
    }
}

impl Drop for UnreliableChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

pub(crate) fn resolve(
    channel: &'static str,
    address: &str,
    port: u16,
) -> Result<SocketAddr, NetCoreError> {
    let target = format!("{address}:{port}");
    let construction = |source| NetCoreError::Construction {
        channel,
        target: target.clone(),
        source,
    };
    (address, port)
        .to_socket_addrs()
        .map_err(construction)?
        .next()
        .ok_or_else(|| {
            construction(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "address resolved to nothing",
            ))
        })
}

fn bind_listener(addr: SocketAddr) -> std::io::Result<std::net::UdpSocket> {
    let socket = std::net::UdpSocket::bind(addr)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

impl Shared {
    fn deliver(&self, datagram: &[u8], from: SocketAddr) {
        match Notification::decode(datagram) {
            Ok(notification) => {
                trace!("notification {:?} from {from}", notification.type_tag);
                self.dispatcher.dispatch(&mut Inbound::Notification(notification));
            }
            Err(e) => warn!("dropping malformed datagram from {from}: {e}"),
        }
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[cfg(not(test))]
    fn injected_fault(&self) -> Option<std::io::Error> {
        None
    }

    #[cfg(test)]
    fn injected_fault(&self) -> Option<std::io::Error> {
        self.fail_next_recv
            .swap(false, Ordering::AcqRel)
            .then(|| std::io::Error::other("injected receive fault"))
    }
}

async fn listen_loop(
    shared: Arc<Shared>,
    initial: std::net::UdpSocket,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut next = Some(initial);
    let mut buf = vec![0u8; RECV_BUF_SIZE];
    while shared.running() && !*shutdown.borrow() {
        let std_socket = match next.take() {
            Some(s) => s,
            None => match rebind(&shared, &mut shutdown).await {
                Some(s) => s,
                None => break,
            },
        };
        let socket = match UdpSocket::from_std(std_socket) {
            Ok(s) => s,
            Err(e) => {
                warn!("cannot register notification socket on {}: {e}", shared.listen);
                if !worker::pause(shared.spec.reconnect.initial, &mut shutdown).await {
                    break;
                }
                continue;
            }
        };
        info!("listening for notifications on {}", shared.listen);
        let fault = loop {
            if let Some(e) = shared.injected_fault() {
                break Some(e);
            }
            tokio::select! {
                biased;
                _ = shutdown.changed() => break None,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((n, from)) => shared.deliver(&buf[..n], from),
                    Err(e) => break Some(e),
                },
            }
        };
        drop(socket);
        match fault {
            Some(e) => warn!(
                "notification socket on {} faulted: {e}; closing and rebinding",
                shared.listen
            ),
            None => break,
        }
    }
    debug!("notification listener on {} stopped", shared.listen);
}

/// Re-acquire the listen port after a fault, backing off between failed binds.
async fn rebind(
    shared: &Shared,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<std::net::UdpSocket> {
    let backoff = shared.spec.reconnect;
    let mut attempts = 0u32;
    loop {
        if !shared.running() {
            return None;
        }
        match bind_listener(shared.listen) {
            Ok(socket) => {
                let n = shared.rebinds.fetch_add(1, Ordering::AcqRel) + 1;
                info!(
                    "rebound {} after {attempts} failed attempt(s) (rebind #{n})",
                    shared.listen
                );
                return Some(socket);
            }
            Err(e) => {
                attempts += 1;
                if backoff.exhausted(attempts) {
                    error!(
                        "giving up rebinding {} after {attempts} attempts: {e}",
                        shared.listen
                    );
                    shared.running.store(false, Ordering::Release);
                    return None;
                }
                let delay = worker::jittered(backoff.delay(attempts - 1));
                warn!("rebinding {} failed: {e}; retrying in {delay:?}", shared.listen);
                if !worker::pause(delay, shutdown).await {
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netcore_core::{Backoff, Role};
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn collecting_dispatcher() -> (Arc<Dispatcher>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher.set_handler(Arc::new(move |msg: &mut Inbound| {
            let _ = tx.lock().unwrap().send(msg.type_tag().to_string());
        }));
        (dispatcher, rx)
    }

    fn open(spec: LinkSpec, dispatcher: Arc<Dispatcher>) -> UnreliableChannel {
        UnreliableChannel::open(Arc::new(spec), dispatcher).unwrap()
    }

    fn quick_backoff(max_attempts: Option<u32>) -> Backoff {
        Backoff {
            initial: Duration::from_millis(20),
            max: Duration::from_millis(50),
            max_attempts,
        }
    }

    fn run_rebind(channel: &UnreliableChannel) -> Option<std::net::UdpSocket> {
        let (_tx, mut shutdown) = watch::channel(false);
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(rebind(&channel.shared, &mut shutdown))
    }

    #[test]
    fn notification_reaches_peer_listener() {
        let (server_d, server_rx) = collecting_dispatcher();
        let (client_d, _client_rx) = collecting_dispatcher();
        let server = open(LinkSpec::loopback(46110, Role::Server), server_d);
        let client = open(LinkSpec::loopback(46110, Role::Client), client_d);
        server.start().unwrap();
        client.start().unwrap();

        client.send(&Notification::new("PING")).unwrap();
        assert_eq!(server_rx.recv_timeout(Duration::from_secs(5)).unwrap(), "PING");
        client.kill();
        server.kill();
    }

    #[test]
    fn malformed_datagram_is_dropped_and_loop_continues() {
        let (d, rx) = collecting_dispatcher();
        let server = open(LinkSpec::loopback(46120, Role::Server), d);
        server.start().unwrap();
        let raw = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        raw.send_to(&[0xff, 0xfe], server.listen_addr()).unwrap();
        raw.send_to(b"", server.listen_addr()).unwrap();
        raw.send_to(b"STATE", server.listen_addr()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "STATE");
        assert!(server.is_running());
        server.kill();
    }

    #[test]
    fn send_while_stopped_is_silently_dropped() {
        let (d, _rx) = collecting_dispatcher();
        let client = open(LinkSpec::loopback(46130, Role::Client), d);
        assert!(!client.is_running());
        client.send(&Notification::new("PING")).unwrap();
        assert!(client.send(&Notification::new("")).is_err());
        client.start().unwrap();
        assert!(client.is_running());
        client.stop();
        assert!(!client.is_running());
        client.send(&Notification::new("PING")).unwrap();
        client.kill();
        client.kill();
    }

    #[test]
    fn taken_listen_port_is_a_construction_fault() {
        let (d1, _rx1) = collecting_dispatcher();
        let (d2, _rx2) = collecting_dispatcher();
        let spec = Arc::new(LinkSpec::loopback(46140, Role::Server));
        let first = UnreliableChannel::open(spec.clone(), d1).unwrap();
        first.start().unwrap();
        let second = UnreliableChannel::open(spec, d2).unwrap();
        assert!(matches!(
            second.start(),
            Err(NetCoreError::Construction { .. })
        ));
        first.kill();
    }

    #[test]
    fn unresolvable_address_fails_fast() {
        let (d, _rx) = collecting_dispatcher();
        let spec = Arc::new(LinkSpec::new("no such host.invalid", 46150, Role::Client));
        assert!(matches!(
            UnreliableChannel::open(spec, d),
            Err(NetCoreError::Construction { .. })
        ));
    }

    #[test]
    fn receive_fault_rebinds_and_resumes() {
        let (d, rx) = collecting_dispatcher();
        let spec = LinkSpec::loopback(46160, Role::Server).with_reconnect(quick_backoff(None));
        let server = open(spec, d);
        server.start().unwrap();
        let raw = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        raw.send_to(b"READY", server.listen_addr()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "READY");

        // The next pass through the loop fails as if recv_from had errored.
        server.shared.fail_next_recv.store(true, Ordering::Release);
        raw.send_to(b"WAKE", server.listen_addr()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "WAKE");

        let deadline = Instant::now() + Duration::from_secs(5);
        let got = loop {
            assert!(Instant::now() < deadline, "listener did not come back");
            raw.send_to(b"AFTER", server.listen_addr()).unwrap();
            if let Ok(tag) = rx.recv_timeout(Duration::from_millis(50)) {
                break tag;
            }
        };
        assert_eq!(got, "AFTER");
        assert_eq!(server.shared.rebinds.load(Ordering::Acquire), 1);
        assert!(server.is_running());
        server.kill();
    }

    #[test]
    fn rebind_backs_off_while_port_is_held_then_recovers() {
        let (d, _rx) = collecting_dispatcher();
        let spec = LinkSpec::loopback(46170, Role::Server).with_reconnect(quick_backoff(None));
        let channel = open(spec, d);
        channel.shared.running.store(true, Ordering::Release);
        let holder = std::net::UdpSocket::bind(channel.listen_addr()).unwrap();
        let release = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            drop(holder);
        });

        let start = Instant::now();
        let socket = run_rebind(&channel);
        release.join().unwrap();
        assert!(socket.is_some());
        assert!(start.elapsed() >= Duration::from_millis(150));
        assert_eq!(channel.shared.rebinds.load(Ordering::Acquire), 1);
        assert!(channel.is_running());
    }

    #[test]
    fn rebind_gives_up_after_max_attempts() {
        let (d, _rx) = collecting_dispatcher();
        let spec = LinkSpec::loopback(46180, Role::Server).with_reconnect(quick_backoff(Some(3)));
        let channel = open(spec, d);
        channel.shared.running.store(true, Ordering::Release);
        let _holder = std::net::UdpSocket::bind(channel.listen_addr()).unwrap();

        assert!(run_rebind(&channel).is_none());
        assert!(!channel.is_running());
        assert_eq!(channel.shared.rebinds.load(Ordering::Acquire), 0);
    }
}
