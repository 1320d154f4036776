//! Capture frames and compute optical flow in real time

use clap::*;
use flowloop::prelude::v1::{Result, *};
use flowloop::utils::{read_flo, write_flo};
use log::*;
use signal_hook::consts::{SIGINT, SIGTERM};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;
use terminal_size::{terminal_size, Height, Width};

const CHAR_MAP: &str = "$@B%8&WM#*oahkbdpqwmZO0QLCJUYXzcvunxrjft/\\|()1{}[]?-_+~<>i!lI;:,\"^`'. ";

/// Motion, in pixels, that maps to the densest character.
const MAX_RANGE: f32 = 4.0;

fn motion_to_char(magnitude: f32) -> char {
    let range = 0f32.max(magnitude.min(MAX_RANGE)) / MAX_RANGE;
    let idx = (1f32 - range) * (CHAR_MAP.len() - 1) as f32;
    CHAR_MAP.chars().nth(idx.round() as usize).unwrap_or(' ')
}

/// Character grid size that fits `(w, h)` flow into `term` cells.
///
/// Characters are roughly twice as tall as they are wide.
fn ascii_size((w, h): (usize, usize), (tw, th): (usize, usize)) -> (usize, usize) {
    if w == 0 || h == 0 {
        return (0, 0);
    }

    let cols = tw.min(w).max(1);
    let rows = (cols * h / w / 2).clamp(1, th.max(2) - 1);
    let cols = cols.min(rows * 2 * w / h).max(1);

    (cols, rows)
}

fn render_ascii(flow: &FlowField, term: (usize, usize)) -> String {
    let (w, h) = ascii_size(flow.dim(), term);
    let small = flow.downsample(w, h);

    let mut out = String::with_capacity((w + 1) * h);

    for y in 0..h {
        for x in 0..w {
            out.push(motion_to_char(small.get_motion(x, y).magnitude()));
        }
        out.push('\n');
    }

    out
}

fn flow_summary(flow: &FlowField) -> String {
    let mean = flow.mean_motion();
    format!(
        "{}x{} mean ({:.3}, {:.3}) |mean| {:.3} max {:.3}",
        flow.dim().0,
        flow.dim().1,
        mean.x,
        mean.y,
        flow.mean_magnitude(),
        flow.max_magnitude()
    )
}

fn terminal() -> (usize, usize) {
    if let Some((Width(w), Height(h))) = terminal_size() {
        (w as usize, h as usize)
    } else {
        (80, 30)
    }
}

/// Print a previously written `.flo` file.
fn dump(path: &str) -> Result<()> {
    let flow = read_flo(BufReader::new(File::open(path)?))?;
    print!("{}", render_ascii(&flow, terminal()));
    println!("{}: {}", path, flow_summary(&flow));
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let matches = Command::new("flow-capture")
        .version(crate_version!())
        .author(crate_authors!())
        .arg(
            Arg::new("input")
                .long("input")
                .short('i')
                .takes_value(true)
                .default_value("synthetic"),
        )
        .arg(Arg::new("width").long("width").short('W').takes_value(true))
        .arg(
            Arg::new("height")
                .long("height")
                .short('H')
                .takes_value(true),
        )
        .arg(Arg::new("fps").long("fps").short('f').takes_value(true))
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .takes_value(true),
        )
        .arg(Arg::new("save-config").long("save-config").takes_value(true))
        .arg(
            Arg::new("output")
                .long("output")
                .short('o')
                .takes_value(true),
        )
        .arg(
            Arg::new("frames")
                .long("frames")
                .short('n')
                .takes_value(true),
        )
        .arg(Arg::new("ascii").long("ascii"))
        .arg(Arg::new("retry").long("retry"))
        .arg(Arg::new("opencv").long("opencv"))
        .arg(
            Arg::new("dump")
                .long("dump")
                .takes_value(true)
                .help("Print a .flo file and exit"),
        )
        .get_matches();

    if let Some(path) = matches.value_of("dump") {
        return dump(path);
    }

    let mut settings = match matches.value_of("config") {
        Some(path) => LoopSettings::load(path)?,
        None => LoopSettings::default(),
    };

    if let Some(w) = matches.value_of("width") {
        settings.constraints.width = w.parse()?;
    }

    if let Some(h) = matches.value_of("height") {
        settings.constraints.height = h.parse()?;
    }

    if let Some(fps) = matches.value_of("fps") {
        settings.target_fps = fps.parse()?;
    }

    if matches.is_present("retry") {
        settings.error_policy = ErrorPolicy::Retry {
            backoff_ms: 100,
            max_retries: 5,
        };
    }

    settings.validate()?;

    if let Some(path) = matches.value_of("save-config") {
        settings.save(path)?;
        info!("saved settings to {}", path);
    }

    let input = matches.value_of("input").unwrap_or("synthetic").to_string();
    let output = matches.value_of("output");
    let frames = matches
        .value_of("frames")
        .map(str::parse::<usize>)
        .transpose()?;
    let ascii = matches.is_present("ascii");

    let estimator = frame_loader::create_estimator(if matches.is_present("opencv") {
        "opencv"
    } else {
        "farneback"
    })?;

    if let Some(output) = output {
        std::fs::create_dir_all(output)?;
    }

    let term = terminal();

    let interrupted = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, interrupted.clone())?;
    signal_hook::flag::register(SIGTERM, interrupted.clone())?;

    let mut worker = CaptureWorker::new(settings);
    debug!("settings: {:?}", worker.settings());
    let results = worker
        .take_results()
        .ok_or_else(|| anyhow!("Results already taken"))?;

    worker.start_capture(
        move |constraints| frame_loader::open_source(&input, constraints),
        estimator,
    )?;

    let mut cnt = 0usize;
    let mut errors = 0usize;
    let mut total = Duration::ZERO;

    let stdout = std::io::stdout();

    while frames.map(|n| cnt < n).unwrap_or(true) {
        if interrupted.load(Ordering::Relaxed) {
            info!("interrupted");
            break;
        }

        let result = match results.recv_timeout(Duration::from_millis(100)) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                if worker.snapshot().stalled || !worker.is_running() {
                    break;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };

        total += result.elapsed;

        let flow = match (&result.flow, &result.error) {
            (Some(flow), _) => flow,
            (None, error) => {
                errors += 1;
                warn!(
                    "tick {}: {}",
                    result.tick_index,
                    error.as_deref().unwrap_or("no flow")
                );
                continue;
            }
        };

        if ascii {
            let mut lock = stdout.lock();
            write!(lock, "{}", render_ascii(flow, term))?;
            writeln!(lock, "tick {} {}", result.tick_index, flow_summary(flow))?;
        }

        if let Some(output) = output {
            let path = format!("{}/{:06}.flo", output, result.tick_index);
            let mut writer = BufWriter::new(File::create(&path)?);
            write_flo(&mut writer, flow)?;
            writer.flush()?;
            trace!("wrote {}", path);
        }

        cnt += 1;
    }

    worker.stop_capture()?;

    let state = worker.snapshot();

    if let Some(err) = &state.cv_error {
        warn!("last error: {}", err);
    }

    let ticks = cnt + errors;

    println!("Frames: {}", cnt);
    println!("Errors: {}", errors);
    println!("Dropped: {}", state.dropped);
    println!("Total: {:.2}ms", total.as_secs_f64() * 1000.0);
    if ticks > 0 {
        println!(
            "Avg: {:.2}ms",
            total.as_secs_f64() * 1000.0 / ticks as f64
        );
    }

    Ok(())
}
