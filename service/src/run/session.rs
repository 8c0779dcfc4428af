//! Terminal progress for backfills.

use crate::sync::ProgressReporter;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::atomic::{AtomicU64, Ordering};

/// Progress bar whose length only grows.
pub struct BackfillProgress {
    bar: ProgressBar,
    total_len: AtomicU64,
}

impl BackfillProgress {
    pub fn new(label: &str) -> Self {
        let bar = ProgressBar::new(0);
        bar.set_draw_target(ProgressDrawTarget::stderr_with_hz(10));
        let style = ProgressStyle::with_template(
            "{bar:40.cyan/blue} {percent:>3}% {pos}/{len} windows | {elapsed_precise} | {msg}",
        )
        .expect("progress style")
        .progress_chars("█▉░");
        bar.set_style(style);
        bar.set_message(label.to_string());
        Self {
            bar,
            total_len: AtomicU64::new(0),
        }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressReporter for BackfillProgress {
    fn set_length(&self, len: u64) {
        let current = self.total_len.load(Ordering::SeqCst);
        if len > current {
            self.total_len.store(len, Ordering::SeqCst);
            self.bar.set_length(len);
        }
    }

    fn inc(&self, delta: u64) {
        self.bar.inc(delta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_never_shrinks() {
        let progress = BackfillProgress::new("test");
        progress.set_length(9);
        progress.set_length(3);
        progress.inc(2);
        assert_eq!(progress.total_len.load(Ordering::SeqCst), 9);
        assert_eq!(progress.bar.length(), Some(9));
        assert_eq!(progress.bar.position(), 2);
        progress.finish();
    }
}
