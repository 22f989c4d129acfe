//! Runs the protocol core on a UDP socket.
//!
//! The engine binds the local port, joins the discovery group and drives
//! two background tasks: one feeding every received datagram through the
//! [`Gateway`] and one calling its poll step on a fixed interval.

use crate::config::EngineConfig;
use crate::crypto::KeyEncryptor;
use crate::error::{GatewayError, Result};
use crate::gateway::{EngineEvent, Gateway, Outbound};
use crate::item::{Command, ItemRegistry};
use crate::protocol::BUFFER_LENGTH;
use futures_core::Stream;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);
const RECEIVE_ERROR_PAUSE: Duration = Duration::from_millis(100);

struct Running {
    socket: Arc<UdpSocket>,
    cancel_token: CancellationToken,
}

struct EngineInner {
    gateway: Arc<Gateway>,
    running: Mutex<Option<Running>>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel_token.cancel();
        }
    }
}

/// Handle to a gateway connection. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Creates a stopped engine.
    pub fn new(config: EngineConfig, items: Arc<dyn ItemRegistry>) -> Self {
        Self::with_gateway(Gateway::new(config, items))
    }

    /// Creates a stopped engine around an existing core.
    pub fn with_gateway(gateway: Gateway) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                gateway: Arc::new(gateway),
                running: Mutex::new(None),
            }),
        }
    }

    /// Creates a stopped engine with a custom write-key primitive.
    pub fn with_encryptor(
        config: EngineConfig,
        items: Arc<dyn ItemRegistry>,
        encryptor: Arc<dyn KeyEncryptor>,
    ) -> Self {
        Self::with_gateway(Gateway::new(config, items).with_encryptor(encryptor))
    }

    pub fn gateway(&self) -> &Gateway {
        &self.inner.gateway
    }

    /// Whether the socket is bound and the loops are running.
    pub fn is_ready(&self) -> bool {
        self.inner.running.lock().is_some()
    }

    /// Binds the socket, starts the background tasks and probes for the
    /// gateway.
    ///
    /// On failure the engine stays stopped and reports
    /// [`GatewayError::SetupFailed`].
    pub async fn start(&self) -> Result<()> {
        if self.is_ready() {
            return Ok(());
        }

        let config = self.inner.gateway.config();
        let socket = match bind_socket(&config) {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                error!("Xiaomi gateway engine is not configured: {}", e);
                return Err(e);
            }
        };
        let cancel_token = CancellationToken::new();

        tokio::spawn(run_receive_loop(
            self.inner.gateway.clone(),
            socket.clone(),
            cancel_token.clone(),
        ));
        if config.auto_poll {
            tokio::spawn(run_poll_loop(
                self.inner.gateway.clone(),
                socket.clone(),
                config.poll_interval,
                cancel_token.clone(),
            ));
        }

        {
            let mut running = self.inner.running.lock();
            if running.is_some() {
                // lost a race with a concurrent start
                cancel_token.cancel();
                return Ok(());
            }
            *running = Some(Running {
                socket: socket.clone(),
                cancel_token,
            });
        }
        info!(
            "Xiaomi gateway engine listening on {}",
            config.bind_target()
        );

        send_all(&socket, vec![self.inner.gateway.whois()]).await
    }

    /// Stops the background tasks, closes the socket and forgets the gateway
    /// and every device.
    pub fn stop(&self) {
        if let Some(running) = self.inner.running.lock().take() {
            running.cancel_token.cancel();
            info!("Xiaomi gateway engine stopped");
        }
        self.inner.gateway.reset();
    }

    /// Runs one poll step now.
    pub async fn tick(&self) -> Result<()> {
        let socket = self.socket()?;
        send_all(&socket, self.inner.gateway.poll()).await
    }

    /// Forwards a host command for `item` to the gateway.
    pub async fn command(&self, item: &str, command: Command) -> Result<()> {
        let socket = self.socket()?;
        let outbound = self.inner.gateway.command_item(item, command)?;
        send_all(&socket, outbound).await
    }

    /// Forgets the gateway; the next poll step sends `whois` again.
    pub fn rediscover(&self) {
        self.inner.gateway.rediscover();
    }

    /// Applies a new configuration.
    ///
    /// Start colour and developer key apply immediately; socket settings and
    /// the poll interval apply on the next [`start`](Self::start).
    pub fn reconfigure(&self, config: EngineConfig) {
        self.inner.gateway.set_config(config);
    }

    /// Stream of discovery notifications.
    pub fn events(&self) -> impl Stream<Item = EngineEvent> + Send + 'static {
        let mut gateways = self.inner.gateway.subscribe();
        let mut devices = self.inner.gateway.devices().subscribe();
        async_stream::stream! {
            loop {
                let event = tokio::select! {
                    res = gateways.recv() => match res {
                        Ok(event) => Some(event),
                        Err(RecvError::Lagged(_)) => None,
                        Err(RecvError::Closed) => break,
                    },
                    res = devices.recv() => match res {
                        Ok(record) => Some(EngineEvent::DeviceDiscovered(record)),
                        Err(RecvError::Lagged(_)) => None,
                        Err(RecvError::Closed) => break,
                    },
                };
                if let Some(event) = event {
                    yield event;
                }
            }
        }
    }

    fn socket(&self) -> Result<Arc<UdpSocket>> {
        self.inner
            .running
            .lock()
            .as_ref()
            .map(|r| r.socket.clone())
            .ok_or(GatewayError::NotRunning)
    }
}

fn bind_socket(config: &EngineConfig) -> Result<UdpSocket> {
    let setup = |e: std::io::Error| GatewayError::SetupFailed(e.to_string());
    let addr = config.bind_target();

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(setup)?;
    socket.set_reuse_address(true).map_err(setup)?;
    socket.bind(&SockAddr::from(addr)).map_err(setup)?;

    let interface = match config.bind_addr {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
    };
    socket
        .join_multicast_v4(&config.multicast_addr, &interface)
        .map_err(setup)?;
    socket.set_nonblocking(true).map_err(setup)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(setup)
}

/// Sends every datagram, continuing past failures. Returns the first error.
async fn send_all(socket: &UdpSocket, outbound: Vec<Outbound>) -> Result<()> {
    let mut first_error = None;
    for out in outbound {
        debug!("Sending {} to {}", out.payload, out.target);
        if let Err(e) = socket.send_to(out.payload.as_bytes(), out.target).await {
            error!("Failed to send to {}: {}", out.target, e);
            first_error.get_or_insert(GatewayError::from(e));
        }
    }
    first_error.map_or(Ok(()), Err)
}

async fn run_receive_loop(
    gateway: Arc<Gateway>,
    socket: Arc<UdpSocket>,
    cancel_token: CancellationToken,
) {
    let mut buf = vec![0u8; BUFFER_LENGTH];
    debug!("Starting Xiaomi gateway receive loop");

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            res = socket.recv_from(&mut buf) => {
                match res {
                    Ok((len, from)) => {
                        debug!("Datagram of {} bytes from {}", len, from);
                        let replies = gateway.handle_datagram(&buf[..len]);
                        let _ = send_all(&socket, replies).await;
                    }
                    Err(e) => {
                        let err = GatewayError::from(e);
                        error!("Receive failed: {}", err);
                        if !err.is_recoverable() {
                            break;
                        }
                        tokio::time::sleep(RECEIVE_ERROR_PAUSE).await;
                    }
                }
            }
        }
    }
    debug!("Xiaomi gateway receive loop stopped");
}

async fn run_poll_loop(
    gateway: Arc<Gateway>,
    socket: Arc<UdpSocket>,
    interval: Duration,
    cancel_token: CancellationToken,
) {
    let period = interval.max(MIN_POLL_INTERVAL);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    debug!("Starting Xiaomi gateway poll loop every {:?}", period);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = send_all(&socket, gateway.poll()).await {
                    warn!("Poll step failed: {}", e);
                    if !e.is_recoverable() {
                        break;
                    }
                }
            }
        }
    }
    debug!("Xiaomi gateway poll loop stopped");
}
