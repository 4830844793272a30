use std::sync::Arc;

use log::warn;
use tokio::{net::UdpSocket, sync::watch};

use crate::participant::State;

/// Receives status updates, media responses, and acknowledgments on the
/// update port. All election state changes happen on this task, which
/// keeps the state machine single-writer.
pub(crate) struct IngestTask {
    pub(crate) state: Arc<State>,
    pub(crate) socket: Arc<UdpSocket>,
    pub(crate) running: watch::Receiver<bool>,
}

impl IngestTask {
    pub(crate) async fn run(mut self) {
        let mut buf = [0u8; 1500];
        loop {
            tokio::select! {
                _ = self.running.changed() => {
                    if !*self.running.borrow() {
                        return;
                    }
                }
                res = self.socket.recv_from(&mut buf) => {
                    match res {
                        Ok((len, src)) => {
                            if Some(src.ip()) == self.state.local_ip() {
                                continue;
                            }
                            self.state.handle_update_datagram(&buf[..len], src);
                        }
                        Err(e) => {
                            // A receive error after stop() is just the socket
                            // closing under us.
                            if self.state.is_running() {
                                warn!(target: "vlink", "problem reading from status socket, stopping: {}", e);
                                let state = self.state.clone();
                                tokio::spawn(async move { state.stop().await });
                            }
                            return;
                        }
                    }
                }
            }
        }
    }
}
