use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thermsync_core::composite::alignment_rect;
use thermsync_core::{
    AlignmentTransform, CaptureSession, ColorSource, Compositor, CompositorConfig, LoopConfig,
    SensorSources, ThermalSource,
};
use thermsync_hw::V4l2StreamDriver;
use tracing_subscriber::EnvFilter;

mod config;
mod preview;

use config::Config;
use preview::FilePreview;

/// Session length for a full cool-down recording.
const COOL_SECS: u64 = 5 * 60;
/// Session length for a baseline recording.
const BASE_SECS: u64 = 60;

#[derive(Parser)]
#[command(
    name = "thermsync",
    about = "Record synchronized thermal + RGB capture sessions"
)]
struct Cli {
    /// Output root; frames go to DIR/cool or DIR/base
    dir: PathBuf,
    /// Record a one-minute baseline session instead of a cool-down session
    #[arg(long)]
    base: bool,
    /// Write into an existing, non-empty session directory
    #[arg(long)]
    overwrite: bool,
    /// Run without the thermal camera (zero frames, nothing saved)
    #[arg(long)]
    ignore_ir: bool,
    /// Run without the color camera (zero frames, nothing saved)
    #[arg(long)]
    ignore_rgb: bool,
    /// Override the session length in seconds
    #[arg(long, value_name = "SECS")]
    duration: Option<u64>,
    /// TOML configuration file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Print the session summary as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    let session_dir = prepare_session_dir(&cli.dir, cli.base, cli.overwrite)?;
    let seconds = cli
        .duration
        .unwrap_or(if cli.base { BASE_SECS } else { COOL_SECS });

    let transform = config
        .tform_path
        .as_deref()
        .map(AlignmentTransform::load)
        .transpose()
        .context("loading alignment transform")?;
    let font = config
        .font_path
        .as_deref()
        .map(load_font)
        .transpose()?;

    let compositor = Compositor::new(
        CompositorConfig {
            frame_rate: config.frame_rate,
            unit: config.unit,
            gamma: config.gamma,
            font_px: config.font_px,
            thermal_enabled: !cli.ignore_ir,
        },
        alignment_rect(transform.as_ref(), config.color_shape()),
        font,
    );

    let loop_config = LoopConfig {
        frame_rate: config.frame_rate,
        display_rate: config.display_rate,
        duration: Duration::from_secs(seconds),
    };

    tracing::info!(
        dir = %session_dir.display(),
        seconds,
        ignore_ir = cli.ignore_ir,
        ignore_rgb = cli.ignore_rgb,
        "thermsync starting"
    );

    let mut session = CaptureSession::new(loop_config, &session_dir, compositor)
        .with_preview(Box::new(FilePreview::new(&session_dir)));
    let report = session
        .run(sensor_sources(&config, cli.ignore_ir, cli.ignore_rgb))
        .context("capture session failed")?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "Captured {} frame pairs into {} ({} previews, {} overruns)",
            report.pairs.len(),
            session_dir.display(),
            report.previews,
            report.overruns
        );
    }

    Ok(())
}

fn sensor_sources(config: &Config, ignore_ir: bool, ignore_rgb: bool) -> SensorSources {
    let thermal = if ignore_ir {
        ThermalSource::Disabled
    } else {
        let driver = match &config.thermal_device {
            Some(path) => V4l2StreamDriver::with_path(path),
            None => V4l2StreamDriver::new(config.thermal_vendor_id, config.thermal_product_id),
        };
        ThermalSource::Stream {
            driver: Box::new(driver),
            timeout: config.thermal_timeout(),
        }
    };
    let color = if ignore_rgb {
        ColorSource::Disabled
    } else {
        ColorSource::v4l2(config.color_shape(), config.color_probe_attempts)
    };
    SensorSources {
        thermal,
        thermal_shape: config.thermal_shape(),
        color,
        color_shape: config.color_shape(),
    }
}

fn load_font(path: &Path) -> Result<ab_glyph::FontVec> {
    let bytes =
        std::fs::read(path).with_context(|| format!("reading font {}", path.display()))?;
    ab_glyph::FontVec::try_from_vec(bytes)
        .with_context(|| format!("parsing font {}", path.display()))
}

/// Resolve `<root>/cool` or `<root>/base` and create it.
///
/// An existing empty directory is reused; a non-empty one requires
/// `overwrite`, in which case files are replaced as the session writes them.
fn prepare_session_dir(root: &Path, base: bool, overwrite: bool) -> Result<PathBuf> {
    let dir = root.join(if base { "base" } else { "cool" });

    if dir.exists() {
        if !dir.is_dir() {
            anyhow::bail!("{} exists and is not a directory", dir.display());
        }
        let empty = std::fs::read_dir(&dir)
            .with_context(|| format!("listing {}", dir.display()))?
            .next()
            .is_none();
        if !empty && !overwrite {
            anyhow::bail!(
                "{} already contains data; pass --overwrite to reuse it",
                dir.display()
            );
        }
    } else {
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    Ok(dir)
}
