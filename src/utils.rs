use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::stream::ProgressUpdater;

/// Renders pass progress on one stderr line, redrawn every `interval` lines
/// and whenever another percent of the input has been consumed.
pub struct ProgressCounter {
    label: &'static str,
    total_bytes: u64,
    interval: u64,
    bytes: AtomicU64,
    count: AtomicU64,
    passed: AtomicU64,
    output_size: AtomicU64,
}

impl ProgressCounter {
    pub fn new(label: &'static str, total_bytes: u64, interval: u64) -> Self {
        let counter = Self {
            label,
            total_bytes,
            interval: interval.max(1),
            bytes: AtomicU64::new(0),
            count: AtomicU64::new(0),
            passed: AtomicU64::new(0),
            output_size: AtomicU64::new(0),
        };
        counter.print();
        counter
    }

    pub fn finish(&self) {
        self.print();
        eprintln!();
    }

    fn percent_of(&self, bytes: u64) -> u64 {
        if self.total_bytes == 0 {
            return 0;
        }
        bytes.saturating_mul(100) / self.total_bytes
    }

    fn print(&self) {
        eprint!("\r{}", self.render());
        let _ = std::io::stderr().flush();
    }

    fn render(&self) -> String {
        let bytes = self.bytes.load(Ordering::SeqCst);
        let mut line = format!("{}: {}", self.label, readable_size(bytes));
        if self.total_bytes > 0 {
            line.push_str(&format!(
                " / {} ({}%)",
                readable_size(self.total_bytes),
                self.percent_of(bytes).min(100)
            ));
        }
        line.push_str(&format!(
            " | features: {} passed: {} | output: {}",
            self.count.load(Ordering::SeqCst),
            self.passed.load(Ordering::SeqCst),
            readable_size(self.output_size.load(Ordering::SeqCst))
        ));
        line
    }
}

impl ProgressUpdater for ProgressCounter {
    fn on_bytes_processed(&self, bytes: u64) {
        let prev = self.bytes.swap(bytes, Ordering::SeqCst);
        if self.percent_of(prev) < self.percent_of(bytes) {
            self.print();
        }
    }

    fn on_counters(&self, count: u64, passed: u64, output_size: u64) {
        let prev = self.count.swap(count, Ordering::SeqCst);
        self.passed.store(passed, Ordering::SeqCst);
        self.output_size.store(output_size, Ordering::SeqCst);
        // Print if we crossed an interval boundary
        if prev / self.interval < count / self.interval {
            self.print();
        }
    }
}

/// Human readable byte count, 1024-based.
pub fn readable_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit])
    }
}
