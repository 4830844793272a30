use std::sync::Arc;

use anyhow::Result;
use log::debug;
use structopt::StructOpt;
use tokio::sync::mpsc;

use vlink::listener::{DeviceAnnouncementListener, DeviceUpdateListener, MasterListener};
use vlink::proto::BeatPacket;
use vlink::{Config, DeviceAnnouncement, DeviceUpdate, Participant};

#[derive(StructOpt)]
#[structopt(
    name = "vlink-util",
    about = "Join a Pro DJ Link network as a virtual player and watch what happens."
)]
struct Opt {
    /// Device name to announce on the network
    #[structopt(long, default_value = "vlink-util")]
    name: String,

    /// Device number to claim; 0 picks an unused one automatically
    #[structopt(long, default_value = "0")]
    device: u8,

    /// Let self-assignment use the real-player numbers 1 through 4
    #[structopt(long)]
    standard_number: bool,

    /// Also send status packets (requires a device number from 1 to 4)
    #[structopt(long)]
    send_status: bool,
}

enum Event {
    Found(DeviceAnnouncement),
    Lost(DeviceAnnouncement),
    Update(DeviceUpdate),
    MasterChanged(Option<u8>),
    TempoChanged(f64),
    MasterBeat(u8),
}

/// Forwards listener callbacks into a channel; callbacks run on the
/// network tasks, so all they do here is enqueue.
struct Monitor {
    events: mpsc::UnboundedSender<Event>,
}

impl DeviceAnnouncementListener for Monitor {
    fn device_found(&self, announcement: &DeviceAnnouncement) {
        let _ = self.events.send(Event::Found(announcement.clone()));
    }

    fn device_lost(&self, announcement: &DeviceAnnouncement) {
        let _ = self.events.send(Event::Lost(announcement.clone()));
    }
}

impl DeviceUpdateListener for Monitor {
    fn received(&self, update: &DeviceUpdate) {
        let _ = self.events.send(Event::Update(update.clone()));
    }
}

impl MasterListener for Monitor {
    fn master_changed(&self, update: Option<&DeviceUpdate>) {
        let _ = self
            .events
            .send(Event::MasterChanged(update.map(|u| u.device_number())));
    }

    fn tempo_changed(&self, tempo: f64) {
        let _ = self.events.send(Event::TempoChanged(tempo));
    }

    fn new_beat(&self, beat: &BeatPacket) {
        let _ = self.events.send(Event::MasterBeat(beat.device_number));
    }
}

fn print_event(event: Event) {
    match event {
        Event::Found(device) => {
            println!(
                "device found: {} \"{}\" at {}",
                device.number, device.name, device.address
            );
        }
        Event::Lost(device) => {
            println!("device lost: {} \"{}\"", device.number, device.name);
        }
        Event::Update(update) => {
            debug!(
                "status from {}: master={} tempo={:?}",
                update.device_number(),
                update.is_tempo_master(),
                update.effective_tempo()
            );
        }
        Event::MasterChanged(Some(number)) => println!("tempo master is now device {}", number),
        Event::MasterChanged(None) => println!("tempo master resigned"),
        Event::TempoChanged(tempo) => println!("master tempo is now {:.2} BPM", tempo),
        Event::MasterBeat(number) => debug!("master beat from device {}", number),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let opt = Opt::from_args();

    let participant = Participant::new(Config {
        name: opt.name,
        device_number: opt.device,
        use_standard_player_number: opt.standard_number,
        ..Config::default()
    })?;

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let monitor = Arc::new(Monitor { events: events_tx });
    participant.registry().add_device_listener(monitor.clone());
    participant.add_update_listener(monitor.clone());
    participant.add_master_listener(monitor);

    participant.start().await?;
    println!(
        "joined as device {} \"{}\" on {}",
        participant.device_number(),
        participant.device_name(),
        participant
            .local_address()
            .map(|a| a.to_string())
            .unwrap_or_default()
    );

    if opt.send_status {
        participant.set_sending_status(true).await?;
        println!("sending status packets");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events_rx.recv() => match event {
                Some(event) => print_event(event),
                None => break,
            }
        }
    }

    println!("terminating");
    participant.stop().await;
    Ok(())
}
