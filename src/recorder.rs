/*
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Shared session state and the per-tick pipeline.
//!
//! [`Recorder`] holds everything readers need (interner, bucket ring,
//! thread records) behind a single `RwLock`; [`Sampler`] is owned by the
//! sampling loop and does the heavy work of a tick (capture and parse)
//! outside the lock, taking the write lock only to intern and publish the
//! completed bucket. A reader therefore sees either the previous head or
//! the new one, never a torn state or a partially filled bucket.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use parking_lot::RwLock;

use crate::capture::StackCapture;
use crate::dump;
use crate::intern::Interner;
use crate::ring::Bucket;
use crate::ring::BucketRing;
use crate::trace::Frame;
use crate::trace::ProfileSlice;
use crate::trace::Sample;
use crate::trace::ThreadMetadata;
use crate::trace::Trace;

/// Initial size of the raw capture buffer. Grows geometrically on
/// truncation and is then retained for the rest of the session.
const INITIAL_STACK_BUFFER: usize = 32 * 1024;

pub(crate) struct Recorder {
    start: Instant,
    caller_thread_id: u64,
    inner: RwLock<Inner>,
}

struct Inner {
    interner: Interner,
    ring: BucketRing,
    /// Append-only: a thread stays here even after all of its samples have
    /// aged out of the ring, so older windows still resolve names.
    threads: HashMap<u64, ThreadMetadata>,
}

impl Recorder {
    pub(crate) fn new(start: Instant, caller_thread_id: u64, ring_capacity: usize) -> Self {
        Recorder {
            start,
            caller_thread_id,
            inner: RwLock::new(Inner {
                interner: Interner::new(),
                ring: BucketRing::with_capacity(ring_capacity),
                threads: HashMap::new(),
            }),
        }
    }

    pub(crate) fn start_time(&self) -> Instant {
        self.start
    }

    /// Assemble a trace for the window `[from, to]`, both relative to the
    /// session start (instants before it clamp to the start). Returns
    /// `None` when no retained sample falls inside the window.
    pub(crate) fn get_slice(&self, from: Instant, to: Instant) -> Option<ProfileSlice> {
        let from_ns = from.saturating_duration_since(self.start).as_nanos() as u64;
        let to_ns = to.saturating_duration_since(self.start).as_nanos() as u64;

        let inner = self.inner.read();
        let mut samples = Vec::new();
        for bucket in inner.ring.iter() {
            // Every sample in a bucket shares the tick's elapsed time.
            let Some(first) = bucket.samples.first() else {
                continue;
            };
            let elapsed = first.elapsed_since_start_ns;
            if elapsed < from_ns || elapsed > to_ns {
                continue;
            }
            samples.extend_from_slice(&bucket.samples);
        }
        if samples.is_empty() {
            return None;
        }

        // Tables are session-global and cheap relative to samples; ship
        // them whole so the trace is self-contained.
        Some(ProfileSlice {
            caller_thread_id: self.caller_thread_id,
            trace: Trace {
                samples,
                stacks: inner.interner.stacks().to_vec(),
                frames: inner.interner.frames().to_vec(),
                thread_metadata: inner.threads.clone(),
            },
        })
    }

    #[cfg(test)]
    pub(crate) fn stats(&self) -> RecorderStats {
        let inner = self.inner.read();
        RecorderStats {
            frames: inner.interner.frames().len(),
            stacks: inner.interner.stacks().len(),
            new_frames: inner.interner.new_frames().len(),
            new_stacks: inner.interner.new_stacks().len(),
            threads: inner.threads.len(),
            retained_samples: inner.ring.sample_count(),
            ring_capacity: inner.ring.capacity(),
            latest_bucket_samples: inner.ring.latest().map(|b| b.samples.len()),
        }
    }
}

#[cfg(test)]
#[derive(Debug)]
pub(crate) struct RecorderStats {
    pub frames: usize,
    pub stacks: usize,
    pub new_frames: usize,
    pub new_stacks: usize,
    pub threads: usize,
    pub retained_samples: usize,
    pub ring_capacity: usize,
    pub latest_bucket_samples: Option<usize>,
}

/// Loop-owned half of a session: the capture primitive, the reusable raw
/// buffer and the tick pipeline.
pub(crate) struct Sampler {
    recorder: Arc<Recorder>,
    capture: Box<dyn StackCapture>,
    pub(crate) stacks_buffer: Vec<u8>,
}

impl Sampler {
    pub(crate) fn new(recorder: Arc<Recorder>, capture: Box<dyn StackCapture>) -> Self {
        Sampler {
            recorder,
            capture,
            stacks_buffer: vec![0; INITIAL_STACK_BUFFER],
        }
    }

    /// Capture a raw dump of all thread stacks, growing the buffer until
    /// the dump fits. Returns the dump length in `self.stacks_buffer`.
    pub(crate) fn collect_records(&mut self) -> Result<usize> {
        loop {
            let n = self.capture.capture_all_stacks(&mut self.stacks_buffer)?;
            if n < self.stacks_buffer.len() {
                return Ok(n);
            }
            let grown = self.stacks_buffer.len().saturating_mul(2).max(64);
            self.stacks_buffer = vec![0; grown];
        }
    }

    /// Execute one tick: capture, parse, intern, publish one bucket.
    /// On error nothing is published; the caller contains the fault.
    pub(crate) fn on_tick(&mut self) -> Result<()> {
        let elapsed_ns = self.recorder.start.elapsed().as_nanos() as u64;

        let len = self.collect_records()?;
        let text = std::str::from_utf8(&self.stacks_buffer[..len])
            .context("stack capture produced invalid utf-8")?;
        let dumps = dump::parse(text)?;

        let mut inner = self.recorder.inner.write();
        inner.interner.begin_tick();
        let mut bucket = Bucket {
            samples: Vec::with_capacity(dumps.len()),
        };
        for d in &dumps {
            let frame_indices: Vec<u32> = d
                .frames
                .iter()
                .map(|f| {
                    inner
                        .interner
                        .intern_frame(Frame::from_symbol(f.function, f.abs_path, f.lineno))
                })
                .collect();
            let stack_id = inner.interner.intern_stack(frame_indices);
            bucket.samples.push(Sample {
                thread_id: d.thread_id,
                stack_id,
                elapsed_since_start_ns: elapsed_ns,
            });
            if !inner.threads.contains_key(&d.thread_id) {
                inner.threads.insert(
                    d.thread_id,
                    ThreadMetadata {
                        name: d.name.to_string(),
                    },
                );
            }
        }
        inner.ring.push(bucket);
        Ok(())
    }
}
