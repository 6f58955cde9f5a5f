/*
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Continuous in-process stack-sampling profiler.
//!
//! - Samples every registered thread periodically (default ~101 Hz).
//! - Interns frames and call chains so memory grows only with distinct
//!   code locations, never with run length.
//! - Retains a fixed window of per-tick sample buckets in a ring buffer.
//! - Answers time-range queries with a self-contained [`Trace`].
//!
//! A tick fault never propagates to the host process: the session marks
//! itself faulted and stops sampling instead.
//!
//! ```no_run
//! use std::time::Instant;
//!
//! let start = Instant::now();
//! let profiler = continuous_profiler::start_profiling(start);
//! // ... workload ...
//! if let Some(slice) = profiler.get_slice(start, Instant::now()) {
//!     // hand slice.trace to the transport layer
//! }
//! profiler.stop(true);
//! ```

mod capture;
mod dump;
mod intern;
mod profiler;
mod recorder;
mod ring;
mod ticker;
mod trace;


pub use capture::StackCapture;
pub use capture::ThreadGuard;
pub use capture::ThreadStackCapture;
pub use capture::current_thread_id;
pub use capture::register_thread;
pub use profiler::DEFAULT_RING_CAPACITY;
pub use profiler::DEFAULT_SAMPLING_INTERVAL;
pub use profiler::Profiler;
pub use profiler::ProfilerBuilder;
pub use profiler::SessionState;
pub use profiler::start_profiling;
pub use ticker::IntervalTicker;
pub use ticker::MIN_SAMPLING_INTERVAL;
pub use ticker::ManualTicker;
pub use ticker::ManualTickerHandle;
pub use ticker::TickSource;
pub use ticker::TickStopper;
pub use ticker::manual_ticker;
pub use trace::Frame;
pub use trace::ProfileSlice;
pub use trace::Sample;
pub use trace::ThreadMetadata;
pub use trace::Trace;
