/*
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Session lifecycle: starting, stopping and querying a profiling session.
//!
//! A session owns one background loop thread that executes the tick
//! pipeline. Faults inside a tick are contained here: the loop logs the
//! error, publishes nothing for that tick, marks the session faulted and
//! exits. The host process never observes a panic from the profiler; at
//! worst profiling stops and queries return whatever was collected.

use std::sync::Arc;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;
use tracing::error;

use crate::capture;
use crate::capture::StackCapture;
use crate::capture::ThreadGuard;
use crate::capture::ThreadStackCapture;
use crate::recorder::Recorder;
use crate::recorder::Sampler;
use crate::ticker::IntervalTicker;
use crate::ticker::TickSource;
use crate::ticker::TickStopper;
use crate::trace::ProfileSlice;

/// Default sampling interval (~101 Hz; the odd rate avoids lockstep with
/// common 10 ms periodic work).
pub const DEFAULT_SAMPLING_INTERVAL: Duration = Duration::from_nanos(1_000_000_000 / 101);

/// Default bucket ring capacity: about 30 s of history at the default
/// sampling interval.
pub const DEFAULT_RING_CAPACITY: usize = 3030;

/// Observable session state. A session is already running when
/// [`start_profiling`] returns; both terminal states are final — a new
/// session must be created to resume profiling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Running = 0,
    Stopped = 1,
    Faulted = 2,
}

fn state_from_u8(value: u8) -> SessionState {
    match value {
        0 => SessionState::Running,
        1 => SessionState::Stopped,
        _ => SessionState::Faulted,
    }
}

/// Start a profiling session with the default tick source, capture
/// implementation and retention window. `now` becomes the session start
/// time that sample offsets and query windows are measured against.
pub fn start_profiling(now: Instant) -> Profiler {
    Profiler::builder().start(now)
}

/// Handle to a running profiling session. Queries and stop requests may
/// come from any thread.
pub struct Profiler {
    recorder: Arc<Recorder>,
    state: Arc<AtomicU8>,
    stopper: TickStopper,
    handle: Mutex<Option<JoinHandle<()>>>,
    /// Keeps the thread that started the session registered for capture.
    _caller_registration: ThreadGuard,
}

impl Profiler {
    pub fn builder() -> ProfilerBuilder {
        ProfilerBuilder::new()
    }

    pub fn state(&self) -> SessionState {
        state_from_u8(self.state.load(Ordering::Acquire))
    }

    /// Assemble a trace for `[from, to]`. `None` when the window contains
    /// no samples or the session never completed a tick — a normal
    /// outcome, not an error.
    pub fn get_slice(&self, from: Instant, to: Instant) -> Option<ProfileSlice> {
        self.recorder.get_slice(from, to)
    }

    /// Request termination. With `wait` the call blocks until the loop
    /// thread has fully exited; without it the loop still runs to its
    /// natural shutdown. Stopping twice is a no-op.
    pub fn stop(&self, wait: bool) {
        self.stopper.stop();
        if wait {
            if let Some(handle) = self.handle.lock().take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Profiler {
    fn drop(&mut self) {
        self.stop(true);
    }
}

pub struct ProfilerBuilder {
    interval: Duration,
    ring_capacity: usize,
    tick_source: Option<Box<dyn TickSource>>,
    capture: Option<Box<dyn StackCapture>>,
}

impl ProfilerBuilder {
    pub fn new() -> Self {
        ProfilerBuilder {
            interval: DEFAULT_SAMPLING_INTERVAL,
            ring_capacity: DEFAULT_RING_CAPACITY,
            tick_source: None,
            capture: None,
        }
    }

    /// Sampling interval for the default periodic tick source, clamped to
    /// [`crate::MIN_SAMPLING_INTERVAL`]. Ignored if an explicit
    /// tick source is injected.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Number of tick buckets retained; fixed for the session lifetime.
    /// At least one bucket is always kept.
    pub fn ring_capacity(mut self, capacity: usize) -> Self {
        self.ring_capacity = capacity.max(1);
        self
    }

    /// Substitute the timing event source (tests inject a
    /// [`crate::ticker::ManualTicker`] here).
    pub fn tick_source(mut self, source: impl TickSource) -> Self {
        self.tick_source = Some(Box::new(source));
        self
    }

    /// Substitute the stack capture primitive.
    pub fn capture(mut self, capture: impl StackCapture) -> Self {
        self.capture = Some(Box::new(capture));
        self
    }

    /// Create the session and start its sampling loop. The loop performs
    /// one tick immediately, so a caller that stops right away still gets
    /// at least one bucket.
    pub fn start(self, now: Instant) -> Profiler {
        let caller_thread_id = capture::current_thread_id();
        let caller_name = thread::current().name().unwrap_or("").to_string();
        let caller_registration = capture::register_thread(&caller_name);

        let recorder = Arc::new(Recorder::new(now, caller_thread_id, self.ring_capacity));
        let capture_impl = self
            .capture
            .unwrap_or_else(|| Box::new(ThreadStackCapture::default()));
        let sampler = Sampler::new(recorder.clone(), capture_impl);
        let ticker = self
            .tick_source
            .unwrap_or_else(|| Box::new(IntervalTicker::new(self.interval)));
        let stopper = ticker.stopper();
        let state = Arc::new(AtomicU8::new(SessionState::Running as u8));

        let loop_state = state.clone();
        let handle = thread::Builder::new()
            .name("continuous-profiler".to_string())
            .spawn(move || run_loop(sampler, ticker, loop_state));
        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(err) => {
                error!("failed to spawn profiler thread: {err}");
                state.store(SessionState::Faulted as u8, Ordering::Release);
                None
            }
        };

        Profiler {
            recorder,
            state,
            stopper,
            handle: Mutex::new(handle),
            _caller_registration: caller_registration,
        }
    }
}

impl Default for ProfilerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn run_loop(mut sampler: Sampler, mut ticker: Box<dyn TickSource>, state: Arc<AtomicU8>) {
    let _registration = capture::register_thread("continuous-profiler");
    debug!("profiler session started");

    // Immediate first tick.
    if let Err(err) = sampler.on_tick() {
        fault(&state, &*ticker, err);
        return;
    }

    while ticker.next_tick() {
        if let Err(err) = sampler.on_tick() {
            fault(&state, &*ticker, err);
            return;
        }
        ticker.tick_done();
    }

    state.store(SessionState::Stopped as u8, Ordering::Release);
    debug!("profiler session stopped");
}

fn fault(state: &AtomicU8, ticker: &dyn TickSource, err: anyhow::Error) {
    error!("profiler tick failed, stopping session: {err:#}");
    state.store(SessionState::Faulted as u8, Ordering::Release);
    ticker.stopper().stop();
}
