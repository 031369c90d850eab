use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const SPINNER_TEMPLATE: &str = "{msg} [{spinner:.yellow}]";
const SPINNER_FRAMES: &str = "-\\|/ ";

/// Single-line activity spinner running on its own thread.
///
/// The owner signals completion through an atomic flag and then joins the
/// thread, so once `finish` (or drop) returns nothing else will be drawn and
/// the owner's own output cannot interleave with the animation.
pub struct ProgressIndicator {
    done: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressIndicator {
    /// Start redrawing `message` with a spinner every `interval`
    pub fn start(message: &str, interval: Duration) -> Self {
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        let message = message.to_string();

        let handle = thread::Builder::new()
            .name("bytevalve-progress".to_string())
            .spawn(move || spin(message, interval, flag));

        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                // Cosmetic only; the transfer carries on without it
                warn!("Progress indicator unavailable: {}", e);
                None
            }
        };

        Self { done, handle }
    }

    /// Stop the spinner and wait for its thread to exit
    pub fn finish(mut self) {
        self.stop();
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    fn stop(&mut self) {
        self.done.store(true, Ordering::Release);

        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                debug!("Progress indicator thread panicked");
            }
        }
    }
}

impl Drop for ProgressIndicator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spin(message: String, interval: Duration, done: Arc<AtomicBool>) {
    let style = ProgressStyle::with_template(SPINNER_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars(SPINNER_FRAMES);

    let bar = ProgressBar::new_spinner();
    bar.set_style(style);
    bar.set_message(message);

    while !done.load(Ordering::Acquire) {
        bar.tick();
        thread::park_timeout(interval);
    }

    bar.finish_and_clear();
}
