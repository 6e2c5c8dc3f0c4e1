//! Relay service orchestration.
//!
//! Binds one TCP listener per channel plus the shared UDP socket, then
//! runs an accept loop per listener and the datagram dispatcher until
//! the running flag is cleared.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use tether_core::{
    Channel, ConnectionHandler, DatagramDispatcher, Registry, RelaySettings, TetherError,
    wait_for_stop,
};

use crate::config::RelayConfig;

// ── RelayService ─────────────────────────────────────────────────

/// The top-level relay service.
pub struct RelayService {
    config: RelayConfig,
    running: Arc<AtomicBool>,
}

impl RelayService {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Obtain a handle that can be used to stop the service from
    /// another task.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Signal the service to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bind every listener without accepting yet.
    pub async fn bind(&self) -> Result<BoundRelay, TetherError> {
        let network = &self.config.network;
        let host = network.bind_address.as_str();

        let mut listeners = Vec::with_capacity(Channel::ALL.len());
        for channel in Channel::ALL {
            let port = match channel {
                Channel::Screen => network.screen_port,
                Channel::Control => network.control_port,
                Channel::Chat => network.chat_port,
            };
            let listener = TcpListener::bind((host, port)).await?;
            info!("{channel} listener on {}", listener.local_addr()?);
            listeners.push((channel, listener));
        }

        let udp = if network.enable_udp {
            Some(UdpSocket::bind((host, network.udp_port)).await?)
        } else {
            None
        };

        let settings = self.config.to_relay_settings();
        let registry = Arc::new(Registry::new(settings.max_sessions, settings.grace_period));
        self.running.store(true, Ordering::SeqCst);

        Ok(BoundRelay {
            listeners,
            udp,
            registry,
            settings,
            running: Arc::clone(&self.running),
        })
    }

    /// Bind and serve until stopped.
    pub async fn run(&self) -> Result<(), TetherError> {
        self.bind().await?.serve().await;
        Ok(())
    }
}

// ── BoundRelay ───────────────────────────────────────────────────

/// Listeners bound and ready to serve.
pub struct BoundRelay {
    listeners: Vec<(Channel, TcpListener)>,
    udp: Option<UdpSocket>,
    registry: Arc<Registry>,
    settings: RelaySettings,
    running: Arc<AtomicBool>,
}

impl BoundRelay {
    /// Local address of the listener serving `channel`.
    pub fn local_addr(&self, channel: Channel) -> Option<SocketAddr> {
        self.listeners
            .iter()
            .find(|(c, _)| *c == channel)
            .and_then(|(_, listener)| listener.local_addr().ok())
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp.as_ref().and_then(|udp| udp.local_addr().ok())
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Run every accept loop and the dispatcher until stopped.
    pub async fn serve(self) {
        let mut tasks = JoinSet::new();

        for (channel, listener) in self.listeners {
            let handler = ConnectionHandler::new(Arc::clone(&self.registry), self.settings.clone())
                .for_channel(channel);
            tasks.spawn(accept_loop(listener, handler, Arc::clone(&self.running)));
        }

        if let Some(udp) = self.udp {
            let dispatcher = DatagramDispatcher::new(udp, Arc::clone(&self.registry))
                .with_stop_handle(Arc::clone(&self.running));
            tasks.spawn(async move { dispatcher.run().await });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("relay task failed: {e}");
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("relay service stopped");
    }
}

// ── Internal ─────────────────────────────────────────────────────

async fn accept_loop(listener: TcpListener, handler: ConnectionHandler, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        let accept = tokio::select! {
            result = listener.accept() => result,
            _ = wait_for_stop(&running) => break,
        };

        let (stream, peer) = match accept {
            Ok(pair) => pair,
            Err(e) => {
                warn!("accept error: {e}");
                continue;
            }
        };

        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = handler.handle(stream).await {
                debug!(%peer, "handshake failed: {e}");
            }
        });
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn loopback_config() -> RelayConfig {
        let mut cfg = RelayConfig::default();
        cfg.network.bind_address = "127.0.0.1".into();
        cfg.network.screen_port = 0;
        cfg.network.control_port = 0;
        cfg.network.chat_port = 0;
        cfg.network.udp_port = 0;
        cfg
    }

    #[test]
    fn service_starts_stopped() {
        let svc = RelayService::new(RelayConfig::default());
        assert!(!svc.is_running());
    }

    #[tokio::test]
    async fn bind_exposes_every_listener() {
        let svc = RelayService::new(loopback_config());
        let bound = svc.bind().await.unwrap();
        assert!(svc.is_running());
        for channel in Channel::ALL {
            assert!(bound.local_addr(channel).is_some());
        }
        assert!(bound.udp_addr().is_some());
    }

    #[tokio::test]
    async fn udp_can_be_disabled() {
        let mut cfg = loopback_config();
        cfg.network.enable_udp = false;
        let bound = RelayService::new(cfg).bind().await.unwrap();
        assert!(bound.udp_addr().is_none());
    }

    #[tokio::test]
    async fn stop_handle_ends_serve() {
        let svc = RelayService::new(loopback_config());
        let bound = svc.bind().await.unwrap();
        let serve = tokio::spawn(bound.serve());

        svc.stop();
        tokio::time::timeout(Duration::from_secs(5), serve)
            .await
            .expect("serve did not stop")
            .unwrap();
        assert!(!svc.is_running());
    }
}
