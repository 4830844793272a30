use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use tokio::{net::UdpSocket, sync::watch, time};

use crate::participant::State;
use crate::proto;

/// Broadcasts our presence announcement so the other devices keep sending
/// us updates.
pub(crate) struct AnnounceTask {
    pub(crate) state: Arc<State>,
    pub(crate) socket: Arc<UdpSocket>,
    pub(crate) running: watch::Receiver<bool>,
}

impl AnnounceTask {
    pub(crate) async fn run(mut self) {
        loop {
            let broadcast = match self.state.broadcast_address() {
                Some(addr) => SocketAddr::new(IpAddr::V4(addr), proto::ANNOUNCEMENT_PORT),
                None => return,
            };
            let data = self.state.announcement_bytes();
            if let Err(e) = self.socket.send_to(&data, broadcast).await {
                warn!(target: "vlink", "unable to send announcement packet, shutting down: {}", e);
                let state = self.state.clone();
                tokio::spawn(async move { state.stop().await });
                return;
            }

            let interval = Duration::from_millis(self.state.announce_interval() as u64);
            tokio::select! {
                _ = self.running.changed() => {
                    if !*self.running.borrow() {
                        return;
                    }
                }
                _ = time::sleep(interval) => {}
            }
        }
    }
}
