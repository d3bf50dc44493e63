use once_cell::sync::Lazy;
use regex::Regex;

/// Timeline renderer progress, e.g. `Current Frame: 120, percentage: 40`.
static TIMELINE_PROGRESS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Current Frame:\s*(\d+),\s*percentage:\s*(\d+)").unwrap());

/// Frame backend progress, e.g. `Frame: 57/300`.
static BACKEND_PROGRESS: Lazy<Regex> = Lazy::new(|| Regex::new(r"Frame:\s*(\d+)/(\d+)").unwrap());

/// Encoder frame counter, e.g. `frame=  123 fps= 30 ...`.
static ENCODER_FRAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"frame=\s*(\d+)").unwrap());

pub(crate) fn parse_timeline_progress(line: &str) -> Option<(u64, f64)> {
    let caps = TIMELINE_PROGRESS.captures(line)?;
    let frame = caps.get(1)?.as_str().parse::<u64>().ok()?;
    let percent = caps.get(2)?.as_str().parse::<f64>().ok()?;
    Some((frame, percent.clamp(0.0, 100.0)))
}

pub(crate) fn parse_backend_progress(line: &str) -> Option<(u64, u64)> {
    let caps = BACKEND_PROGRESS.captures(line)?;
    let frame = caps.get(1)?.as_str().parse::<u64>().ok()?;
    let total = caps.get(2)?.as_str().parse::<u64>().ok()?;
    Some((frame, total))
}

pub(crate) fn parse_encoder_frame(line: &str) -> Option<u64> {
    let caps = ENCODER_FRAME.captures(line)?;
    caps.get(1)?.as_str().parse::<u64>().ok()
}
