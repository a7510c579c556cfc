//! Loopback demo: capture from the default microphone and play it straight
//! back out through the default speaker, with a level meter on stderr.
//!
//! Run with RUST_LOG=info for stream negotiation details. Wear headphones,
//! or echo cancellation gets a live workout.

use std::time::{Duration, Instant};

use duplex_audio::{DuplexEngine, EngineConfig};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = EngineConfig::default();
    let mut engine = DuplexEngine::new(config)?;
    engine.start()?;
    log::info!("loopback running, Ctrl-C to quit");

    let mut last_meter = Instant::now();
    loop {
        let captured = engine.read();
        if !captured.is_empty() {
            engine.enqueue(&captured);
        } else {
            // Half a frame at 16 kHz; the rings absorb the jitter.
            std::thread::sleep(Duration::from_millis(10));
        }

        if last_meter.elapsed() >= Duration::from_secs(1) {
            last_meter = Instant::now();
            let rms = engine.get_rms();
            let bars = ((rms / 32_768.0) * 50.0 * 8.0).min(50.0) as usize;
            eprintln!("level {:>7.1}  |{:<50}|", rms, "#".repeat(bars));
        }
    }
}
