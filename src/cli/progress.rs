//! Progress display
//!
//! Renders download progress in the terminal from `TorrentState`
//! snapshots.

use std::io::{self, Write};
use std::time::{Duration, Instant};

use crate::client::TorrentState;

/// Format bytes as a human readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", size, UNITS[unit])
}

/// Format a transfer rate as a human readable string
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec as u64))
}

/// Estimate time to completion from the current rate
pub fn calculate_eta(downloaded: u64, total: u64, speed: f64) -> Option<Duration> {
    if speed <= 0.0 || downloaded >= total {
        return None;
    }
    let remaining = total.saturating_sub(downloaded) as f64;
    Some(Duration::from_secs_f64(remaining / speed))
}

/// Terminal progress line
pub struct ProgressDisplay {
    started: Instant,
    last_downloaded: u64,
    last_sample: Instant,
    speed: f64,
}

impl Default for ProgressDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressDisplay {
    /// Create a display; call `render` with fresh snapshots
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last_downloaded: 0,
            last_sample: now,
            speed: 0.0,
        }
    }

    /// Seconds since the display was created
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Update the rate estimate from a new snapshot
    fn sample(&mut self, downloaded: u64) {
        let dt = self.last_sample.elapsed().as_secs_f64();
        if dt >= 0.5 {
            let delta = downloaded.saturating_sub(self.last_downloaded) as f64;
            self.speed = delta / dt;
            self.last_downloaded = downloaded;
            self.last_sample = Instant::now();
        }
    }

    /// Render a single-line progress update
    pub fn render(&mut self, state: &TorrentState) {
        self.sample(state.bytes_downloaded);
        let eta = calculate_eta(state.bytes_downloaded, state.bytes_total, self.speed)
            .map(|d| format!("{}s", d.as_secs()))
            .unwrap_or_else(|| "-".to_string());

        print!(
            "\r{:>5.1}%  {:>7}/{:<7}  {:>10}  peers {:>2}  eta {}   ",
            state.progress() * 100.0,
            format_bytes(state.bytes_downloaded),
            format_bytes(state.bytes_total),
            format_speed(self.speed),
            state.connected_peers,
            eta,
        );
        let _ = io::stdout().flush();
    }

    /// Terminate the progress line
    pub fn finish(&self) {
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1023), "1023.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(2048.0), "2.00 KB/s");
    }

    #[test]
    fn test_eta() {
        assert_eq!(calculate_eta(0, 1000, 100.0), Some(Duration::from_secs(10)));
        assert_eq!(calculate_eta(1000, 1000, 100.0), None);
        assert_eq!(calculate_eta(0, 1000, 0.0), None);
    }
}
