//! Progress bar for document runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use imgsync_core::ProgressSink;
use indicatif::{ProgressBar, ProgressStyle};

/// One bar over documents; image counts go into its message.
#[derive(Debug)]
pub(crate) struct RunProgress {
    bar: ProgressBar,
    images_done: AtomicUsize,
    images_failed: AtomicUsize,
}

impl RunProgress {
    /// A visible bar, or a hidden one when `enabled` is false.
    pub(crate) fn new(enabled: bool, documents: usize) -> Self {
        let bar = if enabled {
            let bar = ProgressBar::new(documents as u64);
            bar.set_style(
                ProgressStyle::with_template("{spinner} [{pos}/{len}] {wide_msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        } else {
            ProgressBar::hidden()
        };
        Self {
            bar,
            images_done: AtomicUsize::new(0),
            images_failed: AtomicUsize::new(0),
        }
    }

    pub(crate) fn document_done(&self, id: &str) {
        self.bar.inc(1);
        self.bar.set_message(format!("{} {id}", self.image_summary()));
    }

    pub(crate) fn finish(&self) {
        self.bar.finish_and_clear();
    }

    fn image_summary(&self) -> String {
        format!(
            "images: {} done, {} failed |",
            self.images_done.load(Ordering::Relaxed),
            self.images_failed.load(Ordering::Relaxed)
        )
    }
}

impl ProgressSink for RunProgress {
    fn start(&self, _index: usize) {}

    fn complete(&self, _index: usize, success: bool) {
        let counter = if success {
            &self.images_done
        } else {
            &self.images_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.bar.set_message(self.image_summary());
    }
}
