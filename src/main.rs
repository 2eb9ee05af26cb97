use log::{info, warn};
use tokio::sync::broadcast::error::RecvError;

use playctl::config;
use playctl::protocol::Song;
use playctl::{ChangeEvent, PlaybackController};

fn describe_song(song: &Song) -> String {
    match (&song.artist, &song.title) {
        (Some(artist), Some(title)) => format!("{artist} - {title}"),
        (None, Some(title)) => title.clone(),
        _ => song.file.clone(),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut clog = colog::default_builder();
    clog.filter(None, log::LevelFilter::Debug);
    clog.init();

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));

    let config_path = config::default_config_path()?;
    let mut config = config::load_or_create(&config_path)?;
    if let Some(source) = std::env::args().nth(1) {
        config.playback.source = Some(source);
    }

    let controller = PlaybackController::connect(&config)?;
    let mut events = controller.subscribe();
    if config.playback.quit_after_current {
        controller.quit_after_current();
    }

    match &config.playback.source {
        Some(source) => {
            if let Err(err) = controller.start(source) {
                if let Err(shutdown_err) = controller.shutdown() {
                    warn!("Shutdown after failed start also failed: {}", shutdown_err);
                }
                return Err(err.into());
            }
        }
        None => info!("No source configured. Following the daemon's current queue"),
    }

    loop {
        match events.blocking_recv() {
            Ok(ChangeEvent::Finished) => break,
            Ok(ChangeEvent::TrackChanged) => match controller.current_song() {
                Ok(Some(song)) => info!("Now playing: {}", describe_song(&song)),
                Ok(None) => info!("Nothing playing"),
                Err(err) => warn!("Failed to read current song: {}", err),
            },
            Ok(event) => info!("Player event: {:?}", event),
            Err(RecvError::Lagged(skipped)) => {
                warn!("Event listener lagged by {} messages", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }

    controller.shutdown()?;
    info!("Exiting");
    Ok(())
}
