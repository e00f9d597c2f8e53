//! Soak test for the zero-copy picture path.
//!
//! Streams synthetic frames through a [`ZeroCopyPool`] into a mock display
//! port while a completion worker returns buffers the way a driver would.
//! A mock decoder port cycles its output buffers through picture contexts,
//! and an overlay layer tracks the first picture of each frame.
//!
//! ```bash
//! vzc-soak --frames 10000 --pictures-per-frame 4 --reuse 2
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use vzc::pool::mock::{MockAllocator, MockPicture, MockPort};
use vzc::pool::{
    default_completion, HardwarePort, PictureBufferContext, PictureRef, PortPoolRef, PortStatus,
    Rect, ReleaseContext, SubpicStash, ZeroCopyPool,
};
use vzc::tracing_setup::{self, OutputFormat, TracingConfig};
use vzc::VzcConfig;

#[derive(Parser)]
#[command(name = "vzc-soak")]
#[command(about = "Drive the zero-copy buffer pool against mock hardware", long_about = None)]
struct Cli {
    /// Frames to submit
    #[arg(long, default_value = "1000")]
    frames: u64,

    /// Pictures composited per frame
    #[arg(long, default_value = "3")]
    pictures_per_frame: usize,

    /// Pictures carried over unchanged from the previous frame
    #[arg(long, default_value = "1")]
    reuse: usize,

    /// Configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log format (pretty, compact, json); overrides the configuration
    #[arg(long)]
    log_format: Option<OutputFormat>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => VzcConfig::load_from(path),
        None => VzcConfig::load(),
    }
    .context("loading configuration")?;

    let mut tracing_config = TracingConfig::from_logging(&config.logging)?;
    if let Some(format) = cli.log_format {
        tracing_config = tracing_config.with_format(format);
    }
    tracing_setup::init(tracing_config)?;

    let allocator = Arc::new(MockAllocator::new());
    let pool = ZeroCopyPool::new(&config.pool, allocator.clone())?;

    let display = Arc::new(MockPort::new("display"));
    display
        .enable(default_completion("display"))
        .map_err(|status| anyhow::anyhow!("enabling display port: {status}"))?;

    let decoder = Arc::new(MockPort::new("decoder"));
    decoder
        .enable(default_completion("decoder"))
        .map_err(|status| anyhow::anyhow!("enabling decoder port: {status}"))?;
    let decoder_pool = PortPoolRef::create(decoder.clone(), config.pool.header_count)?;
    decoder_pool.fill()?;

    let overlay_port = Arc::new(MockPort::new("overlay"));
    let mut overlay = SubpicStash::open(overlay_port.clone(), 2, config.pool.header_count)?;

    let stop = Arc::new(AtomicBool::new(false));
    let completer = {
        let stop = Arc::clone(&stop);
        let display = Arc::clone(&display);
        let overlay_port = Arc::clone(&overlay_port);
        let decoder_ref = decoder_pool.acquire();
        tokio::task::spawn_blocking(move || {
            while !stop.load(Ordering::Acquire) {
                display.complete_all(PortStatus::Ok);
                overlay_port.complete_all(PortStatus::Ok);
                std::thread::sleep(Duration::from_micros(200));
            }
            display.complete_all(PortStatus::Ok);
            // Last holder; the decoder pool is torn down off this thread.
            decoder_ref.release(ReleaseContext::Callback);
        })
    };

    let started = Instant::now();
    let reuse = cli.reuse.min(cli.pictures_per_frame);
    let mut pictures: Vec<PictureRef> = Vec::new();
    let mut dropped = 0u64;

    for frame in 0..cli.frames {
        let kept = pictures.len().min(reuse);
        pictures.truncate(kept);
        while pictures.len() < cli.pictures_per_frame {
            let value = (frame as usize + pictures.len()) as u8;
            pictures.push(MockPicture::yuv420(320, 240, value));
        }

        let decoded = decoder.take_in_flight().map(|buf| {
            let ctx = PictureBufferContext::new(buf, &decoder_pool);
            let copy = ctx.copy();
            ctx.destroy();
            copy
        });

        for (i, picture) in pictures.iter().enumerate() {
            let rect = Rect::new(i as i32 * 320, 0, 320, 240);
            match pool.buffer_from_picture(picture, i == 0, rect, 255) {
                Ok(buf) => {
                    if i == 0 {
                        if let Err(e) = overlay.update(Some(&buf), picture.pts()) {
                            warn!(error = %e, "Overlay update failed");
                        }
                    }
                    if let Err(e) = display.send(buf) {
                        warn!(status = %e.status, "Display refused buffer");
                        dropped += 1;
                    }
                }
                Err(e) if e.is_transient() => dropped += 1,
                Err(e) => return Err(e).context("staging picture"),
            }
        }

        if let Some(ctx) = decoded {
            ctx.destroy();
        }
    }

    overlay.close();
    decoder_pool.release(ReleaseContext::Caller);
    stop.store(true, Ordering::Release);
    completer.await.context("completion worker panicked")?;
    pool.shutdown();

    let elapsed = started.elapsed();
    let stats = pool.stats();
    info!(?stats, "Soak finished");

    println!("frames:          {}", cli.frames);
    println!("elapsed:         {:.2?}", elapsed);
    println!("dropped:         {dropped}");
    println!("allocations:     {}", stats.allocations);
    println!("reuse hits:      {}", stats.reuse_hits);
    println!("cache hits:      {}", stats.cache_hits);
    println!("copies:          {}", stats.copies);
    println!("evictions:       {}", stats.evictions);
    println!("live entries:    {}", stats.live);
    println!("blocks freed:    {}", allocator.frees());
    println!("display sends:   {}", display.sent_count());
    println!("overlay sends:   {}", overlay_port.sent_count());
    println!("decoder sends:   {}", decoder.sent_count());

    Ok(())
}
