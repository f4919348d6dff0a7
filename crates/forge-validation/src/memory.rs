//! Peak resident-memory sampling for probed server processes.
//!
//! Sampling polls `sysinfo` on a background thread and is best-effort: very
//! short spikes can be missed, and an uninspectable process yields `None`.
//! From async code, stop it with [`MemorySampler::finish_blocking`] so the
//! thread join happens on the blocking pool.

use core::time::Duration;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use sysinfo::{Pid, System};
use tokio::task::spawn_blocking;

/// Samples the resident set size of one process until stopped.
pub struct MemorySampler {
    stop: Arc<AtomicBool>,
    peak_bytes: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl MemorySampler {
    /// Start sampling `pid` every `interval`.
    pub fn start(pid: u32, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let peak_bytes = Arc::new(AtomicU64::new(0));

        let thread_stop = Arc::clone(&stop);
        let thread_peak = Arc::clone(&peak_bytes);

        let handle = thread::spawn(move || {
            let pid = Pid::from_u32(pid);
            let mut system = System::new();

            // Sample before checking the stop flag so even a short probe records one value.
            loop {
                system.refresh_process(pid);
                let Some(process) = system.process(pid) else {
                    break;
                };
                thread_peak.fetch_max(process.memory(), Ordering::Relaxed);
                if thread_stop.load(Ordering::Relaxed) {
                    break;
                }
                thread::sleep(interval);
            }
        });

        Self {
            stop,
            peak_bytes,
            handle: Some(handle),
        }
    }

    /// Peak observed so far, in bytes.
    pub fn peak_bytes(&self) -> Option<u64> {
        match self.peak_bytes.load(Ordering::Relaxed) {
            0 => None,
            bytes => Some(bytes),
        }
    }

    /// Stop sampling and return the peak in bytes.
    ///
    /// Joins the sampling thread, which can take up to one interval.
    pub fn finish(mut self) -> Option<u64> {
        self.join();
        self.peak_bytes()
    }

    /// [`Self::finish`] on the blocking pool.
    pub async fn finish_blocking(self) -> Option<u64> {
        let peak_bytes = Arc::clone(&self.peak_bytes);
        match spawn_blocking(move || self.finish()).await {
            Ok(peak) => peak,
            Err(err) => {
                tracing::warn!("Memory sampler join failed: {err}");
                Some(peak_bytes.load(Ordering::Relaxed)).filter(|bytes| *bytes > 0)
            }
        }
    }

    fn join(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        let panicked = self
            .handle
            .take()
            .is_some_and(|handle| handle.join().is_err());
        if panicked {
            tracing::warn!("Memory sampler thread panicked");
        }
    }
}

/// Dropping only signals the thread; it exits after its current sleep.
impl Drop for MemorySampler {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process;
    use tokio::time::sleep;

    #[test]
    fn test_samples_current_process() {
        let sampler = MemorySampler::start(process::id(), Duration::from_millis(5));
        thread::sleep(Duration::from_millis(50));
        let peak = sampler.finish();
        assert!(peak.is_some_and(|bytes| bytes > 0));
    }

    #[test]
    fn test_unknown_pid_yields_none() {
        let sampler = MemorySampler::start(u32::MAX - 7, Duration::from_millis(5));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(sampler.finish(), None);
    }

    #[tokio::test]
    async fn test_finish_blocking_from_async_context() {
        let sampler = MemorySampler::start(process::id(), Duration::from_millis(5));
        sleep(Duration::from_millis(50)).await;
        let peak = sampler.finish_blocking().await;
        assert!(peak.is_some_and(|bytes| bytes > 0));
    }
}
