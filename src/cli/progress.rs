//! Progress display module
//!
//! Renders transfer statistics as a single refreshing terminal line.

use std::io::{self, Write};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::tracker::TransferStats;

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed to human readable string
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec as u64))
}

/// Format duration to human readable string
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Remaining time at the current speed
pub fn calculate_eta(done: u64, total: u64, speed: f64) -> Option<Duration> {
    if speed <= 0.0 || done >= total {
        return None;
    }

    let remaining = total.saturating_sub(done) as f64;
    Some(Duration::from_secs_f64(remaining / speed))
}

/// Progress display for CLI
pub struct ProgressDisplay {
    /// When the display was created
    start_time: Instant,
    /// Time of the last redraw
    last_update: Instant,
    /// Minimum gap between redraws
    update_interval: Duration,
    /// Suppress all output
    quiet: bool,
    /// Verified bytes at the last redraw, for speed
    last_completed: u64,
    /// Bytes per second over the last interval
    speed: f64,
}

impl ProgressDisplay {
    /// Display redrawing at most twice a second
    pub fn new(quiet: bool) -> Self {
        Self::with_interval(quiet, Duration::from_millis(500))
    }

    /// Display with a custom redraw interval
    pub fn with_interval(quiet: bool, interval: Duration) -> Self {
        Self {
            start_time: Instant::now(),
            last_update: Instant::now(),
            update_interval: interval,
            quiet,
            last_completed: 0,
            speed: 0.0,
        }
    }

    /// Redraw if the update interval has elapsed
    pub fn update(&mut self, stats: &TransferStats) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }

        let elapsed = self.last_update.elapsed();
        if elapsed < self.update_interval {
            return Ok(());
        }

        let completed = stats.completed();
        self.speed = completed.saturating_sub(self.last_completed) as f64 / elapsed.as_secs_f64();
        self.last_completed = completed;
        self.last_update = Instant::now();

        print!("\r\x1b[2K{}", self.render(stats));
        io::stdout().flush()
    }

    /// Progress line for the given snapshot
    pub fn render(&self, stats: &TransferStats) -> String {
        let bar_width: usize = 40;
        let filled = ((stats.progress() * bar_width as f64) as usize).min(bar_width);
        let bar = "=".repeat(filled) + &" ".repeat(bar_width - filled);

        let eta = calculate_eta(stats.completed(), stats.total, self.speed)
            .map(format_duration)
            .unwrap_or_else(|| "∞".to_string());

        format!(
            "[{}] {:.1}% | {} / {} | ↓ {} | Saving: {} | ETA: {}",
            bar,
            stats.progress() * 100.0,
            format_bytes(stats.saved),
            format_bytes(stats.total),
            format_speed(self.speed),
            format_bytes(stats.saving),
            eta,
        )
    }

    /// Follow `stats` until the transfer completes or the sender goes away
    pub async fn follow(mut self, mut stats: watch::Receiver<TransferStats>) -> io::Result<()> {
        let mut tick = tokio::time::interval(self.update_interval);
        loop {
            tick.tick().await;
            let snapshot = *stats.borrow_and_update();
            self.update(&snapshot)?;
            if snapshot.is_complete() {
                return self.print_complete(&snapshot);
            }
            if !stats.has_changed().unwrap_or(false) && stats.changed().await.is_err() {
                return Ok(());
            }
        }
    }

    /// Print completion message
    pub fn print_complete(&self, stats: &TransferStats) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }

        print!("\r\x1b[2K");
        io::stdout().flush()?;

        println!();
        println!("Download Complete!");
        println!("  Saved: {} / {}", format_bytes(stats.saved), format_bytes(stats.total));
        if stats.corrupted > 0 {
            println!("  Pieces failing hash check: {}", stats.corrupted);
        }
        println!("  Elapsed Time: {}", format_duration(self.start_time.elapsed()));

        Ok(())
    }

    /// Print a summary for an interrupted or failed run
    pub fn print_summary(&self, stats: &TransferStats) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }

        println!();
        println!("Transfer Statistics:");
        println!("  Saved: {} / {} ({:.1}%)",
            format_bytes(stats.saved),
            format_bytes(stats.total),
            stats.progress() * 100.0
        );
        println!("  Pieces failing hash check: {}", stats.corrupted);
        println!("  Failed writes: {}", stats.save_failures);
        println!("  Elapsed Time: {}", format_duration(self.start_time.elapsed()));

        Ok(())
    }

    /// Print a status message
    pub fn print_status(&self, message: &str) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }

        println!("\r\x1b[2K{}", message);
        Ok(())
    }

    /// Print an error message
    pub fn print_error(&self, message: &str) -> io::Result<()> {
        eprintln!("\r\x1b[2KError: {}", message);
        Ok(())
    }

    /// Time since the display was created
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// True when output is suppressed
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(1024.0), "1.00 KB/s");
        assert_eq!(format_speed(1024.0 * 1024.0), "1.00 MB/s");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h 1m 1s");
    }

    #[test]
    fn test_calculate_eta() {
        assert_eq!(calculate_eta(50, 100, 10.0), Some(Duration::from_secs(5)));
        assert_eq!(calculate_eta(100, 100, 10.0), None);
        assert_eq!(calculate_eta(50, 100, 0.0), None);
    }

    #[test]
    fn test_render_half_saved() {
        let display = ProgressDisplay::new(false);
        let stats = TransferStats {
            saved: 512,
            not_started: 512,
            ..TransferStats::new(1024)
        };
        let line = display.render(&stats);
        assert!(line.starts_with(&format!("[{}{}]", "=".repeat(20), " ".repeat(20))));
        assert!(line.contains("50.0%"));
        assert!(line.contains("512.00 B / 1.00 KB"));
    }

    #[test]
    fn test_quiet_display_is_silent() {
        let display = ProgressDisplay::with_interval(true, Duration::from_millis(10));
        assert!(display.is_quiet());
        assert!(!ProgressDisplay::new(false).is_quiet());

        std::thread::sleep(Duration::from_millis(20));
        assert!(display.elapsed() >= Duration::from_millis(20));
        assert!(display.print_status("hidden").is_ok());
    }

    #[tokio::test]
    async fn test_follow_stops_on_completion() {
        let (tx, rx) = watch::channel(TransferStats::new(10));
        let display = ProgressDisplay::with_interval(true, Duration::from_millis(10));
        let handle = tokio::spawn(display.follow(rx));

        tx.send(TransferStats { saved: 10, not_started: 0, ..TransferStats::new(10) }).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_follow_stops_when_sender_dropped() {
        let (tx, rx) = watch::channel(TransferStats::new(10));
        let display = ProgressDisplay::with_interval(true, Duration::from_millis(10));
        let handle = tokio::spawn(display.follow(rx));

        drop(tx);
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap().unwrap();
    }
}
