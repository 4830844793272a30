use std::sync::Arc;
use std::time::Duration;

use tokio::{net::UdpSocket, sync::watch, time};

use crate::participant::State;

/// Sends our synthesized status packets to every device on the network,
/// several times a second, while status sending is enabled.
pub(crate) struct StatusTask {
    pub(crate) state: Arc<State>,
    pub(crate) socket: Arc<UdpSocket>,
    pub(crate) running: watch::Receiver<bool>,
}

impl StatusTask {
    pub(crate) async fn run(mut self) {
        loop {
            self.state.send_status(&self.socket).await;

            let interval = Duration::from_millis(self.state.status_interval() as u64);
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
