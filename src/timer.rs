// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Single-shot countdown used to bound discovery.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

type TickFn = dyn Fn(u32) + Send + Sync;
type StopFn = dyn Fn() + Send + Sync;

/// One running countdown.
struct Run {
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Countdown ticking once per second.
///
/// `on_tick` receives the remaining whole seconds after every elapsed second
/// except the last; `on_stop` runs once when the countdown reaches zero,
/// right after starting for a zero-length countdown.
/// After [`CountdownTimer::cancel`] neither callback runs again.
pub struct CountdownTimer {
    total_secs: u32,
    on_tick: Arc<TickFn>,
    on_stop: Arc<StopFn>,
    run: Mutex<Option<Run>>,
}

impl CountdownTimer {
    /// Create a stopped timer.
    pub fn new<T, S>(total_secs: u32, on_tick: T, on_stop: S) -> Self
    where
        T: Fn(u32) + Send + Sync + 'static,
        S: Fn() + Send + Sync + 'static,
    {
        Self {
            total_secs,
            on_tick: Arc::new(on_tick),
            on_stop: Arc::new(on_stop),
            run: Mutex::new(None),
        }
    }

    /// Total duration in seconds.
    pub fn total_secs(&self) -> u32 {
        self.total_secs
    }

    /// Start counting down. A countdown already in progress is cancelled
    /// and replaced.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        self.cancel();

        let cancelled = Arc::new(AtomicBool::new(false));
        let total = self.total_secs;
        let on_tick = Arc::clone(&self.on_tick);
        let on_stop = Arc::clone(&self.on_stop);
        let flag = Arc::clone(&cancelled);
        let started = Instant::now();

        let task = tokio::spawn(async move {
            if total == 0 {
                flag.store(true, Ordering::SeqCst);
                debug!("Countdown of 0s finished at once");
                on_stop();
                return;
            }

            for elapsed in 1..=total {
                tokio::time::sleep_until(started + Duration::from_secs(u64::from(elapsed))).await;
                if flag.load(Ordering::SeqCst) {
                    return;
                }

                let remaining = total - elapsed;
                if remaining == 0 {
                    flag.store(true, Ordering::SeqCst);
                    debug!("Countdown of {}s finished", total);
                    on_stop();
                } else {
                    on_tick(remaining);
                }
            }
        });

        *self.run.lock() = Some(Run { cancelled, task });
    }

    /// Stop the countdown without running `on_stop`. Safe to call at any time.
    pub fn cancel(&self) {
        if let Some(run) = self.run.lock().take() {
            run.cancelled.store(true, Ordering::SeqCst);
            run.task.abort();
        }
    }

    /// Check whether a countdown is in progress.
    pub fn is_running(&self) -> bool {
        self.run
            .lock()
            .as_ref()
            .map(|run| !run.cancelled.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

impl Drop for CountdownTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
