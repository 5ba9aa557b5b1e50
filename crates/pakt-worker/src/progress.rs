//! Download progress estimation from pacman's transaction summary.

use std::time::Instant;

/// Tracks how far the package downloads have come.
///
/// pacman without a progress bar only announces each file as it starts,
/// so progress is counted in files and the byte total from the summary is
/// spread evenly over them.
#[derive(Debug, Default)]
pub struct DownloadTracker {
    total_items: usize,
    total_bytes: u64,
    started_items: usize,
    started_at: Option<Instant>,
}

/// A progress sample: percent done, bytes per second, seconds left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub percentage: u8,
    pub speed: u64,
    pub eta: u64,
}

impl DownloadTracker {
    pub fn set_total_items(&mut self, items: usize) {
        self.total_items = items;
    }

    pub fn set_total_bytes(&mut self, bytes: u64) {
        self.total_bytes = bytes;
    }

    pub fn total_items(&self) -> usize {
        self.total_items
    }

    /// Records that another file started downloading at `now`.
    pub fn item_started(&mut self, now: Instant) -> Progress {
        let started_at = *self.started_at.get_or_insert(now);
        let done = self.started_items;
        self.started_items += 1;

        // Items can outnumber the summary when databases are fetched too.
        let total = self.total_items.max(self.started_items);
        let percentage = (done * 100 / total).min(100) as u8;

        let bytes_done = self.total_bytes * done as u64 / total as u64;
        let elapsed = now.duration_since(started_at).as_secs_f64();
        let speed = if elapsed > 0.0 {
            (bytes_done as f64 / elapsed) as u64
        } else {
            0
        };
        let eta = if speed > 0 {
            (self.total_bytes - bytes_done) / speed
        } else {
            0
        };

        Progress {
            percentage,
            speed,
            eta,
        }
    }

    /// The final sample once all downloads are done.
    pub fn finished(&self, now: Instant) -> Progress {
        let elapsed = self
            .started_at
            .map(|start| now.duration_since(start).as_secs_f64())
            .unwrap_or_default();
        let speed = if elapsed > 0.0 {
            (self.total_bytes as f64 / elapsed) as u64
        } else {
            0
        };
        Progress {
            percentage: 100,
            speed,
            eta: 0,
        }
    }
}

/// Parses a pacman size such as `9.54 MiB` into bytes.
pub fn parse_size(text: &str) -> Option<u64> {
    let mut parts = text.split_whitespace();
    let value: f64 = parts.next()?.parse().ok()?;
    let multiplier: f64 = match parts.next().unwrap_or("B") {
        "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    if value < 0.0 {
        return None;
    }
    Some((value * multiplier).round() as u64)
}
