//! UDP transport.
//!
//! One socket serves both directions: sends go to the configured remote
//! application, and a receive task decodes every inbound datagram and hands
//! it to the bridge over an mpsc channel. Nothing on the send path can block
//! the receive loop.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use avaconf::BridgeConfig;
use avaproto::{decode_datagram, encode_bundle, encode_message, Bundle, Message, MAX_DATAGRAM};
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{BridgeError, Result};

/// Where encoded messages go. Implemented by [`OscTransport`]; tests swap in
/// recorders.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn send_message(&self, message: &Message) -> bool;
    async fn send_bundle(&self, bundle: &Bundle) -> bool;
    fn is_open(&self) -> bool;
}

/// One decoded inbound datagram.
#[derive(Debug, Clone)]
pub struct InboundPacket {
    pub origin: SocketAddr,
    pub timetag: Option<u64>,
    pub messages: Vec<Message>,
}

#[derive(Debug, Default)]
pub struct TransportStats {
    sent: AtomicU64,
    received: AtomicU64,
    errors: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransportStatsSnapshot {
    pub sent: u64,
    pub received: u64,
    pub errors: u64,
    pub dropped: u64,
}

impl TransportStats {
    pub fn snapshot(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Socket settings pulled out of a config snapshot.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub send_host: String,
    pub send_port: u16,
    pub receive_port: u16,
    pub auto_retry: bool,
    pub retry_delay: Duration,
    pub max_bind_retries: u32,
    pub verbose: bool,
}

impl TransportOptions {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            send_host: config.send_host.clone(),
            send_port: config.send_port,
            receive_port: config.receive_port,
            auto_retry: config.auto_retry_on_error,
            retry_delay: config.retry_delay_duration(),
            max_bind_retries: config.max_bind_retries,
            verbose: config.verbose_mode,
        }
    }
}

/// Wildcard local address in the same family as `target`.
fn bind_addr(target: &SocketAddr, port: u16) -> SocketAddr {
    let ip = match target {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, port)
}

pub struct OscTransport {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    local_port: u16,
    open: AtomicBool,
    stats: Arc<TransportStats>,
    verbose: bool,
}

impl OscTransport {
    /// Bind the local endpoint and resolve the remote one.
    ///
    /// When the port is taken and auto-retry is on, the next port up is tried
    /// after `retry_delay`, up to `max_bind_retries` extra attempts. Check
    /// [`OscTransport::local_port`] for the port actually bound.
    pub async fn open(opts: &TransportOptions) -> Result<Self> {
        let target = tokio::net::lookup_host((opts.send_host.as_str(), opts.send_port))
            .await
            .map_err(|e| {
                BridgeError::Transport(format!("cannot resolve {}: {}", opts.send_host, e))
            })?
            .next()
            .ok_or_else(|| {
                BridgeError::Transport(format!("no address for {}", opts.send_host))
            })?;

        let mut port = opts.receive_port;
        let mut attempt = 0u32;
        let socket = loop {
            match UdpSocket::bind(bind_addr(&target, port)).await {
                Ok(socket) => break socket,
                Err(e)
                    if e.kind() == std::io::ErrorKind::AddrInUse
                        && opts.auto_retry
                        && port != 0
                        && attempt < opts.max_bind_retries =>
                {
                    attempt += 1;
                    warn!(
                        port,
                        attempt,
                        max = opts.max_bind_retries,
                        "receive port in use, trying next port"
                    );
                    tokio::time::sleep(opts.retry_delay).await;
                    port = port.checked_add(1).ok_or_else(|| {
                        BridgeError::Transport("ran out of ports to try".to_string())
                    })?;
                }
                Err(e) => {
                    return Err(BridgeError::Transport(format!(
                        "failed to bind UDP port {}: {}",
                        port, e
                    )))
                }
            }
        };

        let local_port = socket.local_addr()?.port();
        info!(local_port, %target, "OSC transport open");

        Ok(Self {
            socket: Arc::new(socket),
            target,
            local_port,
            open: AtomicBool::new(true),
            stats: Arc::new(TransportStats::default()),
            verbose: opts.verbose,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn stats(&self) -> TransportStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop sending. The receive task stops with its cancellation token.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            debug!(local_port = self.local_port, "OSC transport closed");
        }
    }

    /// Spawn the receive loop. Datagrams from non-local origins are dropped.
    pub fn spawn_receiver(
        &self,
        tx: mpsc::Sender<InboundPacket>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        let stats = Arc::clone(&self.stats);
        let verbose = self.verbose;

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let (len, origin) = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = socket.recv_from(&mut buf) => match result {
                        Ok(received) => received,
                        Err(e) => {
                            stats.errors.fetch_add(1, Ordering::Relaxed);
                            warn!("UDP receive error: {}", e);
                            continue;
                        }
                    },
                };

                if !is_trusted_origin(origin.ip()) {
                    stats.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(%origin, "dropping datagram from non-local origin");
                    continue;
                }

                let decoded = match decode_datagram(&buf[..len]) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        stats.errors.fetch_add(1, Ordering::Relaxed);
                        debug!(%origin, len, "undecodable datagram: {}", e);
                        continue;
                    }
                };
                if decoded.skipped > 0 {
                    stats
                        .dropped
                        .fetch_add(decoded.skipped as u64, Ordering::Relaxed);
                }
                stats
                    .received
                    .fetch_add(decoded.messages.len() as u64, Ordering::Relaxed);

                if verbose {
                    for msg in &decoded.messages {
                        debug!(address = %msg.address, args = ?msg.args, "OSC in");
                    }
                }

                let packet = InboundPacket {
                    origin,
                    timetag: decoded.timetag,
                    messages: decoded.messages,
                };
                if tx.send(packet).await.is_err() {
                    debug!("inbound channel closed, stopping receiver");
                    break;
                }
            }
            trace!("receive loop exited");
        })
    }

    async fn send_bytes(&self, bytes: &[u8], count: u64) -> bool {
        if !self.is_open() {
            return false;
        }
        match self.socket.send_to(bytes, self.target).await {
            Ok(_) => {
                self.stats.sent.fetch_add(count, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!(target = %self.target, "UDP send failed: {}", e);
                false
            }
        }
    }
}

#[async_trait]
impl Outbound for OscTransport {
    async fn send_message(&self, message: &Message) -> bool {
        let bytes = match encode_message(message) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(address = %message.address, "not sending: {}", e);
                return false;
            }
        };
        if self.verbose {
            debug!(address = %message.address, args = ?message.args, "OSC out");
        } else {
            trace!(address = %message.address, "OSC out");
        }
        self.send_bytes(&bytes, 1).await
    }

    async fn send_bundle(&self, bundle: &Bundle) -> bool {
        let bytes = match encode_bundle(bundle) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(messages = bundle.len(), "not sending bundle: {}", e);
                return false;
            }
        };
        if self.verbose {
            debug!(messages = bundle.len(), timetag = bundle.timetag, "OSC bundle out");
        }
        self.send_bytes(&bytes, bundle.len() as u64).await
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Loopback, private (RFC 1918 / ULA) and link-local addresses.
pub fn is_trusted_origin(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_trusted_origin(IpAddr::V4(mapped));
            }
            let first = v6.segments()[0];
            v6.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}
