/*
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Timing event sources that drive the sampling loop.
//!
//! The loop blocks in [`TickSource::next_tick`] between ticks. Production
//! sessions use [`IntervalTicker`]; tests inject a [`ManualTicker`] whose
//! driver fires ticks on demand and can wait for the loop to finish
//! processing each one.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use std::time::Instant;

/// Produces the timing events consumed by the sampling loop.
pub trait TickSource: Send + 'static {
    /// Block until the next tick fires. Returns `false` once stopped.
    fn next_tick(&mut self) -> bool;

    /// Called by the sampling loop after a source-driven tick has been
    /// fully processed and its bucket published.
    fn tick_done(&mut self) {}

    /// A clonable handle that stops this source from another thread.
    fn stopper(&self) -> TickStopper;
}

/// Stops a tick source and wakes a blocked [`TickSource::next_tick`].
/// Stopping is idempotent.
#[derive(Clone)]
pub struct TickStopper {
    stopped: Arc<AtomicBool>,
    wake: flume::Sender<()>,
}

impl TickStopper {
    fn new() -> (Self, flume::Receiver<()>) {
        let (wake, wake_rx) = flume::bounded(1);
        let stopper = TickStopper {
            stopped: Arc::new(AtomicBool::new(false)),
            wake,
        };
        (stopper, wake_rx)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let _ = self.wake.try_send(());
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Shortest accepted sampling interval; anything below this would spin
/// the loop and starve the profiled threads.
pub const MIN_SAMPLING_INTERVAL: Duration = Duration::from_millis(1);

/// Periodic tick source. Deadline-based rather than sleep-based so the
/// interval is measured between tick starts, not between processing ends.
pub struct IntervalTicker {
    interval: Duration,
    deadline: Instant,
    wake_rx: flume::Receiver<()>,
    stopper: TickStopper,
}

impl IntervalTicker {
    /// Intervals below [`MIN_SAMPLING_INTERVAL`] are clamped to it.
    pub fn new(interval: Duration) -> Self {
        let interval = interval.max(MIN_SAMPLING_INTERVAL);
        let (stopper, wake_rx) = TickStopper::new();
        IntervalTicker {
            interval,
            deadline: Instant::now() + interval,
            wake_rx,
            stopper,
        }
    }
}

impl TickSource for IntervalTicker {
    fn next_tick(&mut self) -> bool {
        loop {
            if self.stopper.is_stopped() {
                return false;
            }
            match self.wake_rx.recv_deadline(self.deadline) {
                // Woken up: re-check the stop flag.
                Ok(()) => continue,
                Err(flume::RecvTimeoutError::Disconnected) => return false,
                Err(flume::RecvTimeoutError::Timeout) => {
                    self.deadline += self.interval;
                    // If processing overran the interval, re-anchor instead
                    // of firing a burst of catch-up ticks.
                    let now = Instant::now();
                    if self.deadline < now {
                        self.deadline = now + self.interval;
                    }
                    return true;
                }
            }
        }
    }

    fn stopper(&self) -> TickStopper {
        self.stopper.clone()
    }
}

/// Test-controlled tick source. Ticks only when the paired
/// [`ManualTickerHandle`] asks for one.
pub struct ManualTicker {
    tick_rx: flume::Receiver<()>,
    done_tx: flume::Sender<()>,
    wake_rx: flume::Receiver<()>,
    stopper: TickStopper,
}

/// Driver side of a [`ManualTicker`].
pub struct ManualTickerHandle {
    tick_tx: flume::Sender<()>,
    done_rx: flume::Receiver<()>,
}

/// Create a manual tick source and its driver handle.
pub fn manual_ticker() -> (ManualTicker, ManualTickerHandle) {
    let (tick_tx, tick_rx) = flume::bounded(1);
    let (done_tx, done_rx) = flume::bounded(1);
    let (stopper, wake_rx) = TickStopper::new();
    (
        ManualTicker {
            tick_rx,
            done_tx,
            wake_rx,
            stopper,
        },
        ManualTickerHandle { tick_tx, done_rx },
    )
}

impl ManualTickerHandle {
    /// Fire one tick and wait until the sampling loop reports it processed.
    /// Returns `false` if the loop has terminated or does not finish the
    /// tick within one second.
    pub fn tick(&self) -> bool {
        // Space ticks apart so consecutive samples get distinct elapsed
        // times instead of all landing on the same nanosecond.
        thread::sleep(Duration::from_millis(1));
        if self.tick_tx.send(()).is_err() {
            return false;
        }
        self.done_rx.recv_timeout(Duration::from_secs(1)).is_ok()
    }
}

impl TickSource for ManualTicker {
    fn next_tick(&mut self) -> bool {
        enum Event {
            Tick(bool),
            Wake,
        }
        loop {
            if self.stopper.is_stopped() {
                return false;
            }
            let event = flume::Selector::new()
                .recv(&self.tick_rx, |r| Event::Tick(r.is_ok()))
                .recv(&self.wake_rx, |_| Event::Wake)
                .wait();
            match event {
                Event::Tick(fired) => return fired && !self.stopper.is_stopped(),
                Event::Wake => continue,
            }
        }
    }

    fn tick_done(&mut self) {
        let _ = self.done_tx.try_send(());
    }

    fn stopper(&self) -> TickStopper {
        self.stopper.clone()
    }
}
