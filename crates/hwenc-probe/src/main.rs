use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use crossbeam_channel::Receiver;

use hwenc::config::Resolution;
use hwenc::frame::NativeFormat;
use hwenc::{
    BackendKind, ChannelSink, EncodeError, FrameBuffer, FrameType, I420Buffer, NativeBuffer,
    OwnedEncodedUnit, Pipeline, RawFrame,
};

/// Feed synthetic frames through a hardware H.264 encoder.
///
/// Useful for bring-up on a new board: checks that the device negotiates,
/// that output is correlated and framed, and that QP extraction works.
#[derive(Parser, Debug)]
#[command(name = "hwenc-probe", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Encoder backend: loopback, loopback-videocore, jetson or videocore.
    #[arg(long)]
    backend: Option<BackendKind>,

    /// Target resolution (QVGA, VGA, HD, FHD, 4K or WxH).
    #[arg(long)]
    resolution: Option<Resolution>,

    /// Target bitrate in bits per second.
    #[arg(long)]
    bitrate: Option<u32>,

    /// Number of frames to submit.
    #[arg(long, default_value_t = 90)]
    frames: u64,

    /// Switch to `--switch-to` at this frame to exercise reconfiguration.
    #[arg(long)]
    switch_resolution_at: Option<u64>,

    /// Resolution used after the switch.
    #[arg(long, default_value = "QVGA")]
    switch_to: Resolution,

    /// Force a key frame every N frames.
    #[arg(long)]
    key_every: Option<u64>,

    /// Feed device-native buffers instead of planar I420.
    #[arg(long)]
    native: bool,

    /// Submit frames back to back instead of at the target framerate.
    #[arg(long)]
    fast: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = hwenc::config::load(cli.config.as_deref())?;
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }
    if let Some(resolution) = cli.resolution {
        config.resolution = resolution;
    }
    if let Some(bitrate) = cli.bitrate {
        config.bitrate_bps = bitrate;
    }
    config.use_native |= cli.native;

    let mut pipeline = Pipeline::from_config(&config)
        .with_context(|| format!("failed to create {} backend", config.backend))?;
    let caps = pipeline.describe_capabilities();
    tracing::info!(
        encoder = caps.implementation_name,
        hardware = caps.hardware_accelerated,
        native = caps.supports_native_handle,
        max_width = caps.max_resolution.0,
        max_height = caps.max_resolution.1,
        "Encoder selected"
    );

    let (tx, units) = crossbeam_channel::unbounded();
    pipeline.register_sink(ChannelSink(tx));
    pipeline
        .configure(&config.settings())
        .context("failed to configure encoder")?;

    let frame_interval_us = 1_000_000 / u64::from(config.framerate.max(1));
    let mut report = Report::default();

    for n in 0..cli.frames {
        let resolution = match cli.switch_resolution_at {
            Some(at) if n >= at => cli.switch_to,
            _ => config.resolution,
        };
        let timestamp_us = (n + 1) * frame_interval_us;
        let frame = synthetic_frame(resolution, n, timestamp_us, config.use_native);
        let forced = cli
            .key_every
            .filter(|every| *every > 0 && n > 0 && n % every == 0)
            .map(|_| FrameType::Key);

        match pipeline.encode(&frame, forced) {
            Ok(()) => report.submitted += 1,
            Err(EncodeError::ResourceExhausted { in_flight }) => {
                tracing::warn!(frame = n, in_flight, "Input queue full, dropping frame");
                report.dropped += 1;
            }
            Err(e) => return Err(e).with_context(|| format!("failed to encode frame {n}")),
        }
        report.drain(&units);

        if !cli.fast {
            std::thread::sleep(Duration::from_micros(frame_interval_us));
        }
    }

    pipeline.release();
    report.drain(&units);
    report.print(&pipeline);
    Ok(())
}

#[allow(clippy::cast_possible_truncation)]
fn synthetic_frame(resolution: Resolution, n: u64, timestamp_us: u64, native: bool) -> RawFrame {
    let luma = (n % 220) as u8 + 16;
    let buffer = if native {
        let (w, h) = (resolution.width as usize, resolution.height as usize);
        FrameBuffer::Native(NativeBuffer {
            format: NativeFormat::I420,
            raw_width: resolution.width,
            raw_height: resolution.height,
            width: resolution.width,
            height: resolution.height,
            data: Bytes::from(vec![luma; w * h * 3 / 2]),
        })
    } else {
        FrameBuffer::I420(I420Buffer::filled(resolution.width, resolution.height, luma))
    };
    RawFrame::new(buffer, timestamp_us)
}

#[derive(Debug, Default)]
struct Report {
    submitted: u64,
    dropped: u64,
    units: u64,
    key_units: u64,
    bytes: usize,
    qp_min: Option<u8>,
    qp_max: Option<u8>,
    sizes: Vec<(u32, u32)>,
}

impl Report {
    fn drain(&mut self, units: &Receiver<OwnedEncodedUnit>) {
        while let Ok(unit) = units.try_recv() {
            self.record(&unit);
        }
    }

    fn record(&mut self, unit: &OwnedEncodedUnit) {
        self.units += 1;
        self.bytes += unit.data.len();
        if unit.frame_type == FrameType::Key {
            self.key_units += 1;
        }
        if let Some(qp) = unit.qp {
            self.qp_min = Some(self.qp_min.map_or(qp, |m| m.min(qp)));
            self.qp_max = Some(self.qp_max.map_or(qp, |m| m.max(qp)));
        }
        let size = (unit.width, unit.height);
        if self.sizes.last() != Some(&size) {
            self.sizes.push(size);
        }
        tracing::debug!(
            timestamp_us = unit.timestamp_us,
            len = unit.data.len(),
            key = unit.frame_type == FrameType::Key,
            qp = ?unit.qp,
            "encoded unit"
        );
    }

    fn print(&self, pipeline: &Pipeline) {
        let stats = pipeline.stats();
        println!("frames submitted:   {}", self.submitted);
        println!("frames dropped:     {}", self.dropped);
        println!("units received:     {} ({} key)", self.units, self.key_units);
        println!("bytes received:     {}", self.bytes);
        match (self.qp_min, self.qp_max) {
            (Some(min), Some(max)) => println!("qp range:           {min}..={max}"),
            _ => println!("qp range:           n/a"),
        }
        let sizes: Vec<String> = self.sizes.iter().map(|(w, h)| format!("{w}x{h}")).collect();
        println!("output sizes:       {}", sizes.join(" -> "));
        println!("sessions:           {}", stats.sessions_configured);
        println!("stale outputs:      {}", stats.stale_outputs);
        println!("malformed units:    {}", stats.malformed_units);
        println!("delivery failures:  {}", stats.delivery_failures);
        println!("device errors:      {}", stats.device_errors);
        if let Some(bytes) = pipeline.estimated_frame_bytes() {
            println!("avg unit size:      {bytes:.0} bytes");
        }
        println!("adjusted bitrate:   {} bps", pipeline.adjusted_bitrate_bps());
    }
}
