// src/main.rs
//! Capture Tape demo
//!
//! Runs a synthetic streaming acquisition into a tape while a consumer
//! replays the chapter live, then prints the write stats and optionally
//! exports what was replayed.

use anyhow::{Context, Result};
use capture_tape::observability::{init_metrics, init_tracing};
use capture_tape::recording::exporter::Exporter;
use capture_tape::recording::record::{TimeUnits, TriggerDirection, TriggerSetup};
use capture_tape::utils::config::DemoSettings;
use capture_tape::{BuildInfo, CaptureRecord, LineId, Scalar, TapeConfig, TapeHandle, WindowAssembler};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const TRIGGER_LEVEL: i16 = 6000;

#[tokio::main]
async fn main() -> Result<()> {
    let config = TapeConfig::load().context("Failed to load configuration")?;

    init_tracing(&config.logging)?;
    init_metrics(&config.metrics)?;

    let build = BuildInfo::current();
    info!(
        "Starting Capture Tape v{} ({}, {})",
        build.version, build.git_hash, build.rustc_version
    );

    let tape = Arc::new(TapeHandle::load(&config).context("Failed to load tape")?);
    let stop = Arc::new(AtomicBool::new(false));
    let demo = config.demo.clone();
    let reply_timeout = config.tape.reply_timeout();

    let producer = tokio::task::spawn_blocking({
        let tape = Arc::clone(&tape);
        let stop = Arc::clone(&stop);
        let demo = demo.clone();
        move || produce(&tape, &demo, &stop)
    });

    let consumer = tokio::task::spawn_blocking({
        let tape = Arc::clone(&tape);
        let chapter = demo.chapter.clone();
        move || consume(&tape, &chapter, reply_timeout)
    });

    let mut session = tokio::spawn(async move {
        producer.await??;
        Ok::<_, anyhow::Error>(consumer.await?)
    });

    let replayed = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, stopping acquisition...");
            stop.store(true, Ordering::Release);
            (&mut session).await??
        }
        result = &mut session => result??,
    };

    if !tape.wait2finish(reply_timeout) {
        warn!("Write queue did not drain");
    }
    match tape.pull_stats(reply_timeout) {
        Ok(Some(stats)) => {
            let bytes: u64 = stats.values().map(|s| s.bytes_written).sum();
            let time: Duration = stats.values().map(|s| s.write_duration).sum();
            info!("{} chunks, {} bytes written in {:?}", stats.len(), bytes, time);
        }
        Ok(None) => info!("Write stats disabled"),
        Err(e) => warn!("Stats unavailable: {}", e),
    }

    info!("Replayed {} chunks of '{}'", replayed.len(), demo.chapter);
    if let Some(path) = demo.export_path.as_ref() {
        let text = Exporter::new(demo.export_format).export(&replayed)?;
        std::fs::write(path, text).with_context(|| format!("Failed to write {:?}", path))?;
        info!("Exported to {:?}", path);
    }

    tape.close();
    info!("Capture Tape stopped");
    Ok(())
}

/// Feed synthetic driver windows through the assembler into the tape
fn produce(tape: &TapeHandle, demo: &DemoSettings, stop: &AtomicBool) -> Result<()> {
    let mut source = SineSource::new(demo);
    let mut assembler = WindowAssembler::new();

    for _ in 0..demo.ticks {
        if stop.load(Ordering::Acquire) {
            break;
        }
        let window = source.next_window();
        match assembler.push(&window) {
            Ok(ready) => {
                for record in &ready {
                    match tape.record(Some(record)) {
                        Err(e) if !e.is_fatal_for_handle() => warn!("Chunk dropped: {}", e),
                        result => result?,
                    }
                }
            }
            Err(e) => warn!("Window dropped: {}", e),
        }
        std::thread::sleep(Duration::from_millis(demo.tick_interval_ms));
    }

    if let Some(last) = assembler.finish() {
        tape.record(Some(&last))?;
    }
    tape.record(None)?;
    info!("Acquisition finished after {} samples", source.produced);
    Ok(())
}

/// Replay the chapter live until the final chunk or end of stream
fn consume(tape: &TapeHandle, chapter: &str, timeout: Duration) -> Vec<CaptureRecord> {
    let mut replayed = Vec::new();
    if !tape.wait2start(Some(chapter), timeout) {
        warn!("Chapter '{}' never started", chapter);
        return replayed;
    }

    loop {
        match tape.play_next(Some(chapter), true, timeout, false) {
            Ok(Some(record)) => {
                let done = record.is_final;
                if let Some(at) = record.trigger_at {
                    info!("Chunk {} triggered at sample {}", record.index, at);
                }
                replayed.push(record);
                if done {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                error!("Replay stopped: {}", e);
                break;
            }
        }
    }
    replayed
}

/// Noisy sine per channel, delivered in windows of varying size
struct SineSource {
    rng: StdRng,
    chapter: String,
    channels: u8,
    bufflen: usize,
    phase: f64,
    produced: u64,
    armed: bool,
}

impl SineSource {
    fn new(demo: &DemoSettings) -> Self {
        Self {
            rng: StdRng::from_entropy(),
            chapter: demo.chapter.clone(),
            channels: demo.channels.max(1),
            bufflen: demo.bufflen,
            phase: 0.0,
            produced: 0,
            armed: true,
        }
    }

    fn next_window(&mut self) -> CaptureRecord {
        let samples = self.rng.gen_range(self.bufflen / 3..=self.bufflen);
        let start = self.bufflen - samples;

        let mut window = CaptureRecord::new(self.chapter.clone(), self.bufflen);
        window.interval = 10;
        window.units = TimeUnits::Us;
        window.device = "SIM-2CH".to_string();
        window.serial = "SIM/0001".to_string();
        window.trigger_set = true;
        window.trigger_setup = Some(TriggerSetup {
            source: LineId::Channel(0),
            threshold: TRIGGER_LEVEL,
            direction: TriggerDirection::Rising,
        });

        let mut previous = i16::MIN;
        for ch in 0..self.channels {
            let mut data = vec![0i16; self.bufflen];
            let offset = f64::from(ch) * std::f64::consts::FRAC_PI_2;
            for (i, sample) in data[start..].iter_mut().enumerate() {
                let t = self.phase + i as f64 * 0.01;
                let noise: f64 = self.rng.gen_range(-300.0..300.0);
                *sample = ((t + offset).sin() * 8000.0 + noise) as i16;

                if ch == 0 && self.armed && previous < TRIGGER_LEVEL && *sample >= TRIGGER_LEVEL {
                    window.trigger_at = Some(i);
                    self.armed = false;
                }
                if ch == 0 {
                    previous = *sample;
                }
            }
            let line = LineId::Channel(ch);
            window.set_array(line, "raw", data);
            window.set_scalar(line, "range", Scalar::Int(7));
            window.set_scalar(line, "overflow", Scalar::Bool(false));
        }

        window.set_window(start, samples);
        window.timestamp = Some(chrono::Utc::now());
        self.phase += samples as f64 * 0.01;
        self.produced += samples as u64;
        window
    }
}
