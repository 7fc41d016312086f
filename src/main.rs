//! Command-line capture harness: stream camera frames into a YUV file.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use uvc_capture::{CaptureConfig, CaptureDevice, FrameCapture};

/// Capture YUV frames from a V4L2 camera into a file.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Device index (/dev/video<N>)
    #[arg(short, long, default_value_t = 0)]
    device: u32,

    /// Frame width in pixels
    #[arg(long, default_value_t = 1280)]
    width: u32,

    /// Frame height in pixels
    #[arg(long, default_value_t = 720)]
    height: u32,

    /// Frame rate in frames per second
    #[arg(long, default_value_t = 10)]
    fps: u32,

    /// Number of frames to capture
    #[arg(short = 'n', long, default_value_t = 50)]
    frames: u64,

    /// Output file for the captured frames
    #[arg(short, long, default_value = "cap_frames.yuv")]
    output: PathBuf,

    /// Write packed frames as captured instead of converting to planar
    #[arg(long)]
    raw: bool,

    /// Print the device capability report before capturing
    #[arg(long)]
    caps: bool,

    /// Bound each frame wait in milliseconds (default: wait forever)
    #[arg(long)]
    timeout_ms: Option<u64>,
}

fn main() {
    let args = Args::parse();
    if let Err(err) = run(&args) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let stop = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&stop);
    ctrlc::set_handler(move || handler_flag.store(true, Ordering::SeqCst))?;

    let mut camera = CaptureDevice::new();
    if let Some(ms) = args.timeout_ms {
        camera.set_read_timeout(Some(Duration::from_millis(ms)));
    }

    let config = CaptureConfig::yuyv(args.width, args.height, args.fps, args.device);
    camera.open(args.device, &config)?;

    let format = camera.negotiated().cloned().ok_or("no negotiated format")?;
    println!(
        "negotiated {}x{} {} at {} fps",
        format.width, format.height, format.fourcc, args.fps
    );

    if args.caps {
        camera.print_capability(args.device)?;
    }

    camera.start(args.device)?;
    println!("capturing {} frames to {}...", args.frames, args.output.display());

    let mut out = BufWriter::new(File::create(&args.output)?);
    let mut frame = vec![0u8; camera.frame_buffer_size().unwrap_or_default()];

    let started = Instant::now();
    let mut captured: u64 = 0;
    let mut written_bytes: u64 = 0;

    while captured < args.frames && !stop.load(Ordering::SeqCst) {
        let read = if args.raw {
            camera.read_frame(&mut frame)
        } else {
            camera.read_frame_planar(&mut frame)
        };
        let info = match read {
            Ok(info) => info,
            // An interrupted wait during shutdown is the stop signal
            // arriving, not a capture failure.
            Err(err) if stop.load(Ordering::SeqCst) => {
                log::debug!("read aborted by stop signal: {err}");
                break;
            }
            Err(err) => return Err(err.into()),
        };
        if info.bytes_used == 0 {
            // Transient empty read, try again.
            continue;
        }

        out.write_all(&frame[..info.bytes_used])?;
        written_bytes += info.bytes_used as u64;
        captured += 1;
        if captured % 25 == 0 {
            println!("captured {captured} frames, {written_bytes} bytes");
        }
    }

    camera.stop()?;
    camera.close()?;
    out.flush()?;

    let elapsed = started.elapsed();
    println!(
        "captured {captured} frames ({written_bytes} bytes) in {} ms",
        elapsed.as_millis()
    );
    Ok(())
}
