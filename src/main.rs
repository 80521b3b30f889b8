//! kmscam: show a V4L2 capture stream on a KMS plane without copying frames

use std::io::BufRead;
use std::path::PathBuf;
use std::thread;

use color_eyre::{eyre::eyre, Result};
use tracing::{debug, error, info, warn};

use kmscam::capture::V4l2Capture;
use kmscam::display::KmsDisplay;
use kmscam::pipeline::{BufferPool, ExitSignal, ExitTrigger, FdPoller, SyncCore};
use kmscam::{utils, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    info!("kmscam launching...");

    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;

    let exit = ExitSignal::new()?;
    let trigger = exit.trigger();
    if config.pipeline.exit_on_stdin {
        watch_stdin(exit.trigger());
    }

    // The frame loop blocks in poll(2), keep it off the runtime's workers
    let mut session = tokio::task::spawn_blocking(move || run_session(config, exit));

    tokio::select! {
        res = &mut session => return res?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received");
            trigger.fire()?;
        }
    }

    session.await?
}

fn init_tracing() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kmscam=info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_timer(fmt::time::uptime()));

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}

/// Any line on stdin asks the pipeline to stop. EOF does not, so it can run detached.
fn watch_stdin(trigger: ExitTrigger) {
    let spawned = thread::Builder::new()
        .name("stdin-exit".into())
        .spawn(move || {
            let mut line = String::new();
            match std::io::stdin().lock().read_line(&mut line) {
                Ok(0) => debug!("stdin closed, only Ctrl-C stops the pipeline"),
                Ok(_) => {
                    if let Err(e) = trigger.fire() {
                        warn!("Failed to signal exit: {}", e);
                    }
                }
                Err(e) => debug!("stdin unreadable: {}", e),
            }
        });
    if let Err(e) = spawned {
        warn!("Could not watch stdin: {}", e);
    }
}

fn pin_to_core(id: usize) {
    let core = core_affinity::get_core_ids()
        .unwrap_or_default()
        .into_iter()
        .find(|core| core.id == id);

    match core {
        Some(core) if core_affinity::set_for_current(core) => {
            info!("Frame loop pinned to CPU {}", id)
        }
        _ => warn!("Could not pin frame loop to CPU {}", id),
    }
}

/// Set up both devices, run the frame loop and tear everything down again.
fn run_session(mut config: Config, exit: ExitSignal) -> Result<()> {
    if let Some(id) = config.pipeline.pin_cpu {
        pin_to_core(id);
    }

    if config.display.card.is_empty() {
        config.display.card = utils::auto_detect_card()?;
    }
    if config.capture.device.is_empty() {
        config.capture.device = utils::auto_detect_device(config.capture.format)?;
    }

    let mut display = KmsDisplay::open(&config.display)?;
    let (mode_w, mode_h) = display.output().size();
    let width = match config.capture.width {
        0 => mode_w,
        w => w,
    };
    let height = match config.capture.height {
        0 => mode_h,
        h => h,
    };

    let format = config.capture.format;
    let mut capture = V4l2Capture::open(&config.capture)?;
    let negotiated = capture.negotiate(width, height, format, None)?;

    let buffers = display.allocate(
        config.capture.buffer_count as usize,
        negotiated.width,
        negotiated.height,
        format,
    )?;
    let pitch = display
        .pitch()
        .ok_or_else(|| eyre!("display allocated no buffers"))?;
    if negotiated.stride != pitch {
        info!(
            "Capture pitch {} differs from scanout pitch {}, renegotiating",
            negotiated.stride, pitch
        );
        let again = capture.negotiate(negotiated.width, negotiated.height, format, Some(pitch))?;
        if again.stride != pitch {
            return Err(eyre!(
                "Capture device insists on {} byte lines, scanout buffers use {}",
                again.stride,
                pitch
            ));
        }
    }

    let mut pool = BufferPool::new(buffers)?;
    capture.import(&mut pool)?;

    let mut poller = FdPoller::new(&exit, &capture, &display)?;
    let mut core = SyncCore::start(pool, capture, display, config.pipeline.stall_timeout())?;

    info!("Pipeline running, press enter or Ctrl-C to stop");
    let outcome = core.run(&mut poller);
    if let Err(e) = &outcome {
        error!("Pipeline failed: {}", e);
    }

    let teardown = core.shutdown();
    if let Some(id) = teardown.abandoned {
        info!("Buffer {} was revoked while waiting for its flip", id);
    }
    // The capture queue references the display's dmabufs, release it first
    drop(teardown.capture);
    drop(teardown.display);

    info!("kmscam shutting down");
    Ok(outcome?)
}
