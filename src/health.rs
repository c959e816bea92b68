// Copyright 2020 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! A single-flight, rate-limited health-check driver.
//!
//! A [`HealthProbe`] guarantees that at most one probe is in flight at a
//! time, and that a fresh probe is not started again before `interval` has
//! elapsed since the last one completed. `Forward` fires a probe
//! fire-and-forget after every failed exchange; `start` additionally drives
//! one on a timer. Both paths share the same single-flight gate so a flurry
//! of failures against an already-down upstream does not flood it with
//! concurrent `SOA .` queries.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};
use tokio::{sync::Mutex, task::JoinHandle, time::Instant};

/// Drives periodic and on-demand health probes for one upstream, ensuring
/// only one probe is ever in flight and that probes are not repeated more
/// often than `interval`.
pub struct HealthProbe {
    in_flight: AtomicBool,
    last_run: Mutex<Option<Instant>>,
    // A plain (non-async) lock: `start` must be able to stash the ticker
    // handle before it returns, with no intervening await, so a second
    // task swapping it in later can't race a `stop()` that runs first.
    handle: StdMutex<Option<JoinHandle<()>>>,
}

impl Default for HealthProbe {
    fn default() -> Self {
        Self {
            in_flight: AtomicBool::new(false),
            last_run: Mutex::new(None),
            handle: StdMutex::new(None),
        }
    }
}

impl HealthProbe {
    /// Creates a probe driver with no background task running.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a probe, given the current `interval`. A no-op if a probe
    /// is already running, or if the last one finished less than `interval`
    /// ago.
    pub async fn check<F, Fut>(self: &Arc<Self>, interval: Duration, check_fn: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("health probe already in flight, skipping");
            return;
        }

        {
            let mut last_run = self.last_run.lock().await;
            if let Some(last) = *last_run {
                if last.elapsed() < interval {
                    self.in_flight.store(false, Ordering::Release);
                    log::debug!("health probe ran too recently, skipping");
                    return;
                }
            }
            *last_run = Some(Instant::now());
        }

        let this = self.clone();
        check_fn().await;
        this.in_flight.store(false, Ordering::Release);
    }

    /// Starts a background task that calls `check_fn` every `interval`.
    /// Replaces any previously running background task; the handle is
    /// stashed before this function returns, so a `stop()` called
    /// immediately afterwards is guaranteed to see and abort it.
    pub fn start<F, Fut>(self: &Arc<Self>, interval: Duration, mut check_fn: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so we don't probe
            // before the caller has had a chance to use the connection.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let fut = check_fn();
                this.check(interval, move || fut).await;
            }
        });

        let mut slot = self.handle.lock().unwrap();
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    /// Stops the background probing task, if one is running. A probe
    /// already in flight is not interrupted.
    pub async fn stop(&self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn single_flight_skips_concurrent_checks() {
        let probe = Arc::new(HealthProbe::new());
        let count = Arc::new(AtomicUsize::new(0));

        let (c1, c2) = (count.clone(), count.clone());
        let p1 = probe.clone();
        let p2 = probe.clone();
        tokio::join!(
            p1.check(Duration::from_secs(60), move || async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                c1.fetch_add(1, Ordering::SeqCst);
            }),
            p2.check(Duration::from_secs(60), move || async move {
                c2.fetch_add(1, Ordering::SeqCst);
            })
        );

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn respects_interval_between_completed_checks() {
        let probe = Arc::new(HealthProbe::new());
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        probe
            .check(Duration::from_secs(60), move || async move {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        let c = count.clone();
        probe
            .check(Duration::from_secs(60), move || async move {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_aborts_background_task() {
        let probe = Arc::new(HealthProbe::new());
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        probe.start(Duration::from_millis(5), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        probe.stop().await;
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn stop_immediately_after_start_aborts_the_ticker() {
        // Regression test: `start` must stash its `JoinHandle` before
        // returning, with no intervening await, so a `stop()` issued right
        // after it (no delay to let a background handle-swap task run)
        // still finds and aborts the ticker.
        let probe = Arc::new(HealthProbe::new());
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        probe.start(Duration::from_millis(1), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        probe.stop().await;

        let seen_at_stop = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen_at_stop);
    }

    #[tokio::test]
    async fn restarting_aborts_the_previous_ticker() {
        let probe = Arc::new(HealthProbe::new());
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let c = first.clone();
        probe.start(Duration::from_millis(5), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        let c = second.clone();
        probe.start(Duration::from_millis(5), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        probe.stop().await;

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert!(second.load(Ordering::SeqCst) >= 1);
    }
}
