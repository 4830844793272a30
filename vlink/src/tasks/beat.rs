use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::{net::UdpSocket, sync::Notify, time};

use crate::metronome::now_ns;
use crate::participant::State;

/// How many milliseconds before a beat we stop sleeping and start spinning,
/// so the packet lands on the beat itself.
pub(crate) const SLEEP_THRESHOLD_MS: i64 = 1;

/// How many milliseconds late a beat packet may still be sent.
pub(crate) const BEAT_THRESHOLD_MS: i64 = 1;

const NS_PER_MS: i64 = 1_000_000;

/// A phase-locked loop that announces each of our beats on the network.
/// It sleeps until just before the next beat, spins through the final
/// sub-millisecond, sends the beat packet, and starts over. Any change to
/// the metronome timeline wakes it so it can recompute its deadline.
pub(crate) struct BeatSender {
    shutdown: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl BeatSender {
    pub(crate) fn start(state: Arc<State>, socket: Arc<UdpSocket>) -> BeatSender {
        let shutdown = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());
        tokio::spawn(run(state, socket, shutdown.clone(), notify.clone()));
        BeatSender { shutdown, notify }
    }

    /// The metronome timeline moved; wake the task to reassess.
    pub(crate) fn timeline_changed(&self) {
        self.notify.notify_one();
    }

    pub(crate) fn shut_down(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

async fn run(state: Arc<State>, socket: Arc<UdpSocket>, shutdown: Arc<AtomicBool>, notify: Arc<Notify>) {
    let mut last_beat_sent: i64 = 0;
    while !shutdown.load(Ordering::Acquire) {
        let snapshot = state.metronome_snapshot();
        // Aim for the beat we just crossed if it has not been announced
        // yet and is still fresh enough, otherwise the next one.
        let distance = snapshot.distance_from_beat();
        let target = if snapshot.beat() > last_beat_sent
            && distance >= 0.0
            && distance <= BEAT_THRESHOLD_MS as f64
        {
            snapshot.beat()
        } else {
            snapshot.beat() + 1
        };
        let target_time = state.metronome_time_of_beat(target);

        let wake_at = target_time - SLEEP_THRESHOLD_MS * NS_PER_MS;
        let now = now_ns();
        if now < wake_at {
            let timeline_moved = tokio::select! {
                _ = notify.notified() => true,
                _ = time::sleep(Duration::from_nanos((wake_at - now) as u64)) => false,
            };
            if timeline_moved {
                continue;
            }
        }
        if shutdown.load(Ordering::Acquire) {
            return;
        }

        // Spin through the last moments so the packet goes out on the beat.
        while now_ns() < target_time {
            std::hint::spin_loop();
        }
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        last_beat_sent = state.send_beat(state.metronome_snapshot_at(target_time), &socket).await;
    }
}
