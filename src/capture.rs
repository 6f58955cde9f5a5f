/*
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Capture of all registered threads' stacks into a textual dump.
//!
//! Threads opt in to profiling by calling [`register_thread`] (the session
//! registers its own caller and loop threads automatically). A capture
//! sends SIGPROF to every registered thread; the signal handler records raw
//! instruction pointers into a preallocated per-thread slot using only
//! async-signal-safe operations, and the capturing thread resolves symbols
//! afterwards.
//!
//! Dump format, one block per thread, blocks separated by a blank line,
//! frames most recent call first:
//!
//! ```text
//! thread <tid> <name>
//! <function>
//! \tat <abs_path>:<lineno>
//! ```

use anyhow::Result;

/// Obtains a point-in-time dump of every live registered thread's stack.
///
/// Writes the dump into `buf` and returns the number of bytes written. A
/// return value equal to `buf.len()` means the dump may have been truncated
/// and the caller should retry with a larger buffer. Errors propagate to
/// the sampling loop's containment boundary; they are never swallowed here.
pub trait StackCapture: Send + 'static {
    fn capture_all_stacks(&mut self, buf: &mut [u8]) -> Result<usize>;
}

pub use imp::ThreadGuard;
pub use imp::ThreadStackCapture;
pub use imp::current_thread_id;
pub use imp::register_thread;

#[cfg(unix)]
mod imp {
    use std::cell::UnsafeCell;
    use std::fmt::Write as _;
    use std::sync::OnceLock;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::thread;
    use std::time::Duration;
    use std::time::Instant;

    use anyhow::Result;
    use anyhow::bail;
    use parking_lot::Mutex;
    use tracing::warn;

    use super::StackCapture;

    const SIG: libc::c_int = libc::SIGPROF;
    const MAX_THREADS: usize = 256;
    const MAX_STACK_DEPTH: usize = 128;
    /// How long one capture waits for signaled threads to record stacks.
    const CAPTURE_TIMEOUT: Duration = Duration::from_millis(100);

    // ── Thread registry ──────────────────────────────────────────────

    struct RegistryEntry {
        pthread: libc::pthread_t,
        tid: u64,
        name: String,
    }

    static REGISTRY: OnceLock<Mutex<Vec<RegistryEntry>>> = OnceLock::new();

    fn registry() -> &'static Mutex<Vec<RegistryEntry>> {
        REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
    }

    fn pthread_eq(a: libc::pthread_t, b: libc::pthread_t) -> bool {
        unsafe { libc::pthread_equal(a, b) != 0 }
    }

    /// OS identifier of the calling thread, used as the sample thread id.
    #[cfg(target_os = "linux")]
    pub fn current_thread_id() -> u64 {
        (unsafe { libc::syscall(libc::SYS_gettid) }) as u64
    }

    #[cfg(not(target_os = "linux"))]
    pub fn current_thread_id() -> u64 {
        (unsafe { libc::pthread_self() }) as usize as u64
    }

    /// Register the calling thread for stack capture. Registration is
    /// per-thread idempotent: a second guard on the same thread is inert
    /// and the first drop wins.
    pub fn register_thread(name: &str) -> ThreadGuard {
        let self_pt = unsafe { libc::pthread_self() };
        let mut reg = registry().lock();
        if reg.iter().any(|e| pthread_eq(e.pthread, self_pt)) {
            return ThreadGuard { registered: None };
        }
        let tid = current_thread_id();
        let name = if name.is_empty() {
            format!("thread-{tid}")
        } else {
            name.to_string()
        };
        reg.push(RegistryEntry {
            pthread: self_pt,
            tid,
            name,
        });
        ThreadGuard {
            registered: Some(self_pt as usize),
        }
    }

    /// Deregisters its thread on drop. The guard remembers the thread it
    /// registered, so it may be dropped from any thread.
    pub struct ThreadGuard {
        registered: Option<usize>,
    }

    impl Drop for ThreadGuard {
        fn drop(&mut self) {
            let Some(pthread) = self.registered else {
                return;
            };
            registry().lock().retain(|e| e.pthread as usize != pthread);
        }
    }

    // ── Per-thread capture slots ─────────────────────────────────────

    struct CaptureSlot {
        armed: AtomicBool,
        done: AtomicBool,
        pthread: AtomicUsize,
        depth: AtomicUsize,
        ips: UnsafeCell<[usize; MAX_STACK_DEPTH]>,
    }

    // `ips` is written by exactly one signal handler invocation per sweep
    // (guarded by `done`) and read only after `done` is observed.
    unsafe impl Sync for CaptureSlot {}

    static SLOTS: OnceLock<Vec<CaptureSlot>> = OnceLock::new();
    static COLLECTING: AtomicBool = AtomicBool::new(false);
    /// Slots and the collecting flag are process-global, so concurrent
    /// sweeps from independent sessions must not overlap.
    static SWEEP: Mutex<()> = Mutex::new(());

    fn slots() -> &'static [CaptureSlot] {
        SLOTS.get_or_init(|| {
            (0..MAX_THREADS)
                .map(|_| CaptureSlot {
                    armed: AtomicBool::new(false),
                    done: AtomicBool::new(false),
                    pthread: AtomicUsize::new(0),
                    depth: AtomicUsize::new(0),
                    ips: UnsafeCell::new([0; MAX_STACK_DEPTH]),
                })
                .collect()
        })
    }

    /// Record the current thread's raw stack into `slot`.
    ///
    /// Async-signal-safe: raw unwinding plus atomic stores, no allocation,
    /// no locks, no syscalls.
    fn record_stack(slot: &CaptureSlot) {
        let ips = slot.ips.get();
        let mut depth = 0usize;
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                if depth < MAX_STACK_DEPTH {
                    (*ips)[depth] = frame.ip() as usize;
                    depth += 1;
                    true
                } else {
                    false
                }
            });
        }
        slot.depth.store(depth, Ordering::Release);
        slot.done.store(true, Ordering::Release);
    }

    extern "C" fn sigprof_handler(
        sig: libc::c_int,
        _info: *mut libc::siginfo_t,
        _ctx: *mut libc::c_void,
    ) {
        if sig != SIG || !COLLECTING.load(Ordering::Acquire) {
            return;
        }
        let Some(slots) = SLOTS.get() else {
            return;
        };
        let self_pt = (unsafe { libc::pthread_self() }) as usize;
        for slot in slots.iter() {
            if !slot.armed.load(Ordering::Acquire)
                || slot.done.load(Ordering::Acquire)
                || slot.pthread.load(Ordering::Acquire) != self_pt
            {
                continue;
            }
            record_stack(slot);
            return;
        }
    }

    fn install_handler() -> Result<()> {
        static INSTALLED: OnceLock<std::result::Result<(), i32>> = OnceLock::new();
        let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
            sigprof_handler;
        let res = INSTALLED.get_or_init(|| unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = handler as usize;
            sa.sa_flags = libc::SA_RESTART | libc::SA_SIGINFO;
            libc::sigemptyset(&mut sa.sa_mask);
            // Prevents re-entrancy.
            libc::sigaddset(&mut sa.sa_mask, SIG);
            if libc::sigaction(SIG, &sa, std::ptr::null_mut()) != 0 {
                Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
            } else {
                Ok(())
            }
        });
        match res {
            Ok(()) => Ok(()),
            Err(errno) => bail!("sigaction(SIGPROF) failed with errno {errno}"),
        }
    }

    // ── Dump assembly ────────────────────────────────────────────────

    /// Frames that belong to the capture machinery itself, not to the
    /// profiled code.
    const NOISE_FRAMES: &[&str] = &[
        "backtrace::",
        "continuous_profiler::capture",
        "sigprof_handler",
        "_Unwind",
        "__restore_rt",
        "sigtramp",
        "__kernel_",
    ];

    fn is_noise_frame(symbol: &str) -> bool {
        NOISE_FRAMES.iter().any(|n| symbol.contains(n))
    }

    /// Append frame lines for `ips` to `out`. Returns the number of frames
    /// written; frames without full symbol information are skipped.
    fn render_frames(out: &mut String, ips: &[usize]) -> usize {
        let mut count = 0;
        let mut symbol_buf = String::new();
        for &ip in ips {
            backtrace::resolve(ip as *mut libc::c_void, |symbol| {
                let (Some(name), Some(file), Some(line)) =
                    (symbol.name(), symbol.filename(), symbol.lineno())
                else {
                    return;
                };
                if line == 0 {
                    return;
                }
                symbol_buf.clear();
                let _ = write!(symbol_buf, "{name}");
                if is_noise_frame(&symbol_buf) {
                    return;
                }
                let _ = writeln!(out, "{symbol_buf}\n\tat {}:{line}", file.display());
                count += 1;
            });
        }
        count
    }

    /// Default capture implementation: SIGPROF broadcast over the thread
    /// registry. The calling thread records its own stack directly.
    #[derive(Default)]
    pub struct ThreadStackCapture {
        // Reused across ticks to avoid per-tick allocation.
        scratch: String,
    }

    impl StackCapture for ThreadStackCapture {
        fn capture_all_stacks(&mut self, buf: &mut [u8]) -> Result<usize> {
            install_handler()?;
            let _sweep = SWEEP.lock();

            let slots = slots();
            let self_pt = unsafe { libc::pthread_self() };

            // Arm and signal while holding the registry lock: deregistration
            // blocks until every signal has been sent, so a thread is never
            // signaled after it has exited.
            let (entries, signaled) = {
                let reg = registry().lock();
                let mut entries = Vec::with_capacity(reg.len().min(MAX_THREADS));
                for (i, e) in reg.iter().take(MAX_THREADS).enumerate() {
                    let slot = &slots[i];
                    slot.pthread.store(e.pthread as usize, Ordering::Release);
                    slot.depth.store(0, Ordering::Release);
                    slot.done.store(false, Ordering::Release);
                    slot.armed.store(true, Ordering::Release);
                    entries.push((e.tid, e.name.clone()));
                }
                COLLECTING.store(true, Ordering::Release);

                let mut signaled = 0usize;
                for (i, e) in reg.iter().take(MAX_THREADS).enumerate() {
                    if pthread_eq(e.pthread, self_pt) {
                        record_stack(&slots[i]);
                    } else {
                        signaled += 1;
                        unsafe {
                            libc::pthread_kill(e.pthread, SIG);
                        }
                    }
                }
                (entries, signaled)
            };

            if signaled > 0 {
                let deadline = Instant::now() + CAPTURE_TIMEOUT;
                loop {
                    let done = (0..entries.len())
                        .filter(|&i| slots[i].done.load(Ordering::Acquire))
                        .count();
                    if done == entries.len() {
                        break;
                    }
                    if Instant::now() >= deadline {
                        warn!(
                            missing = entries.len() - done,
                            "threads did not respond to the capture signal; skipped this tick"
                        );
                        break;
                    }
                    thread::sleep(Duration::from_micros(200));
                }
            }
            COLLECTING.store(false, Ordering::Release);

            let mut w = DumpWriter::new(buf);
            for (i, (tid, name)) in entries.iter().enumerate() {
                let slot = &slots[i];
                if !slot.done.load(Ordering::Acquire) {
                    continue;
                }
                let depth = slot.depth.load(Ordering::Acquire).min(MAX_STACK_DEPTH);
                let ips = unsafe { &*slot.ips.get() };
                let ips = &ips[..depth];
                self.scratch.clear();
                if render_frames(&mut self.scratch, ips) == 0 {
                    continue;
                }
                w.write(format_args!("thread {tid} {name}\n"));
                w.write_str(&self.scratch);
                w.write_str("\n");
            }
            for i in 0..entries.len() {
                slots[i].armed.store(false, Ordering::Release);
            }

            Ok(w.finish())
        }
    }

    /// Writes into a fixed byte buffer, remembering whether it ran out of
    /// room.
    struct DumpWriter<'a> {
        buf: &'a mut [u8],
        pos: usize,
        truncated: bool,
    }

    impl<'a> DumpWriter<'a> {
        fn new(buf: &'a mut [u8]) -> Self {
            DumpWriter {
                buf,
                pos: 0,
                truncated: false,
            }
        }

        fn write_str(&mut self, s: &str) {
            let bytes = s.as_bytes();
            let room = self.buf.len() - self.pos;
            let n = room.min(bytes.len());
            self.buf[self.pos..self.pos + n].copy_from_slice(&bytes[..n]);
            self.pos += n;
            if n < bytes.len() {
                self.truncated = true;
            }
        }

        fn write(&mut self, args: std::fmt::Arguments<'_>) {
            if let Some(s) = args.as_str() {
                self.write_str(s);
            } else {
                self.write_str(&args.to_string());
            }
        }

        /// Bytes written; equals the buffer length when truncated, which
        /// is the caller's signal to grow and retry.
        fn finish(self) -> usize {
            if self.truncated { self.buf.len() } else { self.pos }
        }
    }

    #[cfg(test)]
    mod tests {
        use std::sync::Arc;
        use std::sync::atomic::AtomicBool;
        use std::sync::atomic::Ordering;

        use super::*;
        use crate::dump;

        #[test]
        fn captures_own_and_worker_threads() {
            let _guard = register_thread("capture-test-main");
            let stop = Arc::new(AtomicBool::new(false));
            let worker = thread::spawn({
                let stop = stop.clone();
                move || {
                    let _guard = register_thread("capture-test-worker");
                    while !stop.load(Ordering::Relaxed) {
                        std::hint::spin_loop();
                    }
                }
            });
            // Give the worker time to register.
            thread::sleep(Duration::from_millis(20));

            let mut capture = ThreadStackCapture::default();
            let mut buf = vec![0u8; 128 * 1024];
            let n = capture.capture_all_stacks(&mut buf).unwrap();
            stop.store(true, Ordering::Relaxed);
            worker.join().unwrap();

            assert!(n > 0 && n < buf.len());
            let text = std::str::from_utf8(&buf[..n]).unwrap();
            let dumps = dump::parse(text).unwrap();
            assert!(!dumps.is_empty());
            let my_tid = current_thread_id();
            let me = dumps.iter().find(|d| d.thread_id == my_tid).unwrap();
            assert_eq!(me.name, "capture-test-main");
            assert!(!me.frames.is_empty());
            for frame in &me.frames {
                assert!(!frame.function.is_empty());
                assert!(frame.lineno > 0);
            }
        }

        #[test]
        fn capture_during_thread_churn() {
            let _guard = register_thread("churn-main");
            let stop = Arc::new(AtomicBool::new(false));
            let churner = thread::spawn({
                let stop = stop.clone();
                move || {
                    while !stop.load(Ordering::Relaxed) {
                        let worker = thread::spawn(|| {
                            let _guard = register_thread("churn-worker");
                            thread::sleep(Duration::from_micros(50));
                        });
                        worker.join().unwrap();
                    }
                }
            });

            // Sweeps racing registration and deregistration must still
            // produce well-formed dumps.
            let mut capture = ThreadStackCapture::default();
            let mut buf = vec![0u8; 256 * 1024];
            for _ in 0..25 {
                let n = capture.capture_all_stacks(&mut buf).unwrap();
                let text = std::str::from_utf8(&buf[..n]).unwrap();
                dump::parse(text).unwrap();
            }

            stop.store(true, Ordering::Relaxed);
            churner.join().unwrap();
        }

        #[test]
        fn tiny_buffer_reports_truncation() {
            let _guard = register_thread("capture-test-truncation");
            let mut capture = ThreadStackCapture::default();
            let mut buf = vec![0u8; 8];
            let n = capture.capture_all_stacks(&mut buf).unwrap();
            assert_eq!(n, buf.len());
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use anyhow::Result;
    use anyhow::bail;

    use super::StackCapture;

    /// Stack capture is only implemented for Unix; on other platforms the
    /// session faults on its first tick instead of crashing the host.
    #[derive(Default)]
    pub struct ThreadStackCapture;

    impl StackCapture for ThreadStackCapture {
        fn capture_all_stacks(&mut self, _buf: &mut [u8]) -> Result<usize> {
            bail!("stack capture is not supported on this platform")
        }
    }

    pub struct ThreadGuard(());

    pub fn register_thread(_name: &str) -> ThreadGuard {
        ThreadGuard(())
    }

    pub fn current_thread_id() -> u64 {
        use std::sync::atomic::AtomicU64;
        use std::sync::atomic::Ordering;

        static NEXT: AtomicU64 = AtomicU64::new(1);
        thread_local! {
            static TID: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
        }
        TID.with(|t| *t)
    }
}
