//! `slm-replay`: feed a recorded MP3/FLAC file through a stream session the
//! way a sound level meter would deliver it, and log the measured levels.
//!
//! ```text
//! slm-replay <file> [--fragment-bytes N] [--interval-ms M]
//!                   [--sensitivity V_PER_PA] [--config stream.json]
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use slm_stream::metering::calibration::DEFAULT_MAX_INPUT_VRMS;
use slm_stream::{
    Calibration, SessionStatus, StreamConfig, StreamFormat, StreamSession, SymphoniaDecoder,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Debug)]
struct Args {
    file: PathBuf,
    fragment_bytes: usize,
    interval: Duration,
    sensitivity: Option<f64>,
    config: Option<PathBuf>,
}

fn parse_args() -> Result<Args> {
    let mut file: Option<PathBuf> = None;
    // One WebSocket message of the device carries roughly this much audio.
    let mut fragment_bytes = 1024usize;
    let mut interval_ms = 32u64;
    let mut sensitivity = None;
    let mut config = None;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--fragment-bytes" => {
                let v = it.next().context("missing value for --fragment-bytes")?;
                fragment_bytes = v.parse().context("invalid value for --fragment-bytes")?;
                if fragment_bytes == 0 {
                    bail!("--fragment-bytes must be greater than zero");
                }
            }
            "--interval-ms" => {
                let v = it.next().context("missing value for --interval-ms")?;
                interval_ms = v.parse().context("invalid value for --interval-ms")?;
            }
            "--sensitivity" => {
                let v = it.next().context("missing value for --sensitivity")?;
                sensitivity = Some(v.parse().context("invalid value for --sensitivity")?);
            }
            "--config" => {
                let v = it.next().context("missing value for --config")?;
                config = Some(PathBuf::from(v));
            }
            "--help" | "-h" => {
                println!(
                    "Usage: slm-replay <file.mp3|file.flac> [--fragment-bytes <n>] \
                     [--interval-ms <ms>] [--sensitivity <V/Pa>] [--config <stream.json>]"
                );
                std::process::exit(0);
            }
            other if other.starts_with("--") => bail!("unknown argument: {other}"),
            other => {
                if file.replace(PathBuf::from(other)).is_some() {
                    bail!("only one input file is supported");
                }
            }
        }
    }

    Ok(Args {
        file: file.context("missing input file (see --help)")?,
        fragment_bytes,
        interval: Duration::from_millis(interval_ms),
        sensitivity,
        config,
    })
}

fn stream_format(path: &Path) -> StreamFormat {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(StreamFormat::from_extension)
        .unwrap_or(StreamFormat::Auto)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("slm_replay=info,slm_stream=info")
            }),
        )
        .init();

    let args = parse_args()?;

    let mut config = match &args.config {
        Some(path) => StreamConfig::load(path)
            .with_context(|| format!("loading stream config {}", path.display()))?,
        None => StreamConfig::default(),
    };
    if let Some(sensitivity) = args.sensitivity {
        let cal = Calibration::from_sensitivity(DEFAULT_MAX_INPUT_VRMS, sensitivity)?;
        config.calibration_factor = cal.factor();
        info!(
            max_level_db_spl = %format!("{:.1}", cal.max_level_db_spl()),
            pascal_per_full_scale = %format!("{:.3}", cal.pascal_per_full_scale()),
            "calibration applied"
        );
    }
    let unit = if args.sensitivity.is_some() { "Pa" } else { "FS" };

    let data = std::fs::read(&args.file)
        .with_context(|| format!("reading {}", args.file.display()))?;
    let format = stream_format(&args.file);
    info!(
        file = %args.file.display(),
        bytes = data.len(),
        ?format,
        fragment_bytes = args.fragment_bytes,
        "replaying"
    );

    let session = Arc::new(StreamSession::start(config, SymphoniaDecoder::new(format))?);

    let mut levels = session.subscribe_levels();
    let level_task = tokio::spawn(async move {
        loop {
            match levels.recv().await {
                Ok(ev) => {
                    let r = &ev.report;
                    info!(
                        "Min: {:.3} {unit}, Max: {:.3} {unit}, Peak: {:.1} dB SPL, Peak freq: {:.0} Hz",
                        r.min, r.max, r.peak_db, r.peak_freq_hz
                    );
                }
                Err(RecvError::Lagged(n)) => warn!("level log lagged by {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let feeder_session = Arc::clone(&session);
    let fragment_bytes = args.fragment_bytes;
    let interval = args.interval;
    let feeder = tokio::task::spawn_blocking(move || -> slm_stream::Result<usize> {
        let mut sent = 0;
        for fragment in data.chunks(fragment_bytes) {
            feeder_session.push_fragment(fragment)?;
            sent += 1;
            std::thread::sleep(interval);
        }
        // Flush: the last real fragment is decoded on the next call.
        feeder_session.push_fragment(Vec::new())?;
        Ok(sent)
    });

    tokio::select! {
        fed = feeder => match fed.context("feeder task panicked")? {
            Ok(sent) => info!(fragments = sent, "replay finished"),
            Err(e) => warn!("replay ended early: {e}"),
        },
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    // Let the meter pick up the tail of the stream.
    tokio::time::sleep(session.config().meter_interval() * 2).await;

    let diag = session.diagnostics_snapshot();
    let final_status = session.status();
    session.stop()?;
    level_task.abort();

    info!(
        fragments = diag.fragments_in,
        decode_errors = diag.decode_errors,
        decode_timeouts = diag.decode_timeouts,
        rotations = diag.rotations,
        samples = diag.samples_appended,
        status = ?final_status,
        "session summary"
    );
    if final_status == SessionStatus::Error {
        bail!("session ended with an error");
    }
    Ok(())
}
