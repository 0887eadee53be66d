//! Progress reporting for long-running phases.
//!
//! Engines poll [`ProgressMonitor::is_cancelled`] at round and batch
//! boundaries; transports deliver progress to the peer on side-band
//! channel 2 via [`SideBandProgressMonitor`].

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use wharf_pktline::{encode, Channel};

/// Receives task progress and answers cancellation polls.
pub trait ProgressMonitor {
    /// Begin a task with an optional known total.
    fn begin_task(&mut self, title: &str, total: Option<u64>);
    /// Report the current completed count of the running task.
    fn update(&mut self, completed: u64);
    /// Finish the running task.
    fn end_task(&mut self);
    /// Emit a free-form message.
    fn message(&mut self, text: &str);
    /// Whether the session should abort at the next boundary.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// A monitor that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMonitor;

impl ProgressMonitor for NoopMonitor {
    fn begin_task(&mut self, _title: &str, _total: Option<u64>) {}
    fn update(&mut self, _completed: u64) {}
    fn end_task(&mut self) {}
    fn message(&mut self, _text: &str) {}
}

/// A monitor driven by a shared cancellation flag, wrapping another one.
pub struct CancellableMonitor<M> {
    inner: M,
    flag: Arc<AtomicBool>,
}

impl<M: ProgressMonitor> CancellableMonitor<M> {
    /// Wrap `inner`, aborting when `flag` becomes true.
    pub fn new(inner: M, flag: Arc<AtomicBool>) -> Self {
        Self { inner, flag }
    }
}

impl<M: ProgressMonitor> ProgressMonitor for CancellableMonitor<M> {
    fn begin_task(&mut self, title: &str, total: Option<u64>) {
        self.inner.begin_task(title, total);
    }
    fn update(&mut self, completed: u64) {
        self.inner.update(completed);
    }
    fn end_task(&mut self) {
        self.inner.end_task();
    }
    fn message(&mut self, text: &str) {
        self.inner.message(text);
    }
    fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

const THROTTLE: Duration = Duration::from_millis(500);

#[derive(Debug)]
struct TaskState {
    title: String,
    total: Option<u64>,
    completed: u64,
    last_percent: Option<u64>,
}

/// A throttled reporter that renders task lines onto side-band channel 2.
///
/// Updates are buffered and a packet is emitted at most every 500ms, or at
/// each completed percentage point for bounded tasks.
pub struct SideBandProgressMonitor<W: io::Write> {
    out: W,
    interval: Duration,
    last_emit: Option<Instant>,
    task: Option<TaskState>,
    write_failed: bool,
}

impl<W: io::Write> SideBandProgressMonitor<W> {
    /// Create a monitor writing band frames to `out`.
    pub fn new(out: W) -> Self {
        Self {
            out,
            interval: THROTTLE,
            last_emit: None,
            task: None,
            write_failed: false,
        }
    }

    /// Override the throttle interval, mainly for tests.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    fn interval_elapsed(&self) -> bool {
        self.last_emit.map_or(true, |at| at.elapsed() >= self.interval)
    }

    fn emit(&mut self, line: &str, done: bool) {
        // Progress delivery is best-effort; a failed write mutes further
        // output but never fails the session.
        if self.write_failed {
            return;
        }
        let terminator = if done { "\n" } else { "\r" };
        let text = format!("{line}{terminator}");
        if encode::band_to_write(Channel::Progress, text.as_bytes(), &mut self.out).is_err() {
            self.write_failed = true;
            return;
        }
        self.last_emit = Some(Instant::now());
    }

    fn render(task: &TaskState, done: bool) -> String {
        match task.total {
            Some(total) => {
                let percent = percent_of(task.completed, total);
                if done {
                    format!("{}: 100% ({}/{}), done", task.title, task.completed, total)
                } else {
                    format!("{}: {}% ({}/{})", task.title, percent, task.completed, total)
                }
            }
            None => {
                if done {
                    format!("{}: {}, done", task.title, task.completed)
                } else {
                    format!("{}: {}", task.title, task.completed)
                }
            }
        }
    }
}

fn percent_of(completed: u64, total: u64) -> u64 {
    if total == 0 {
        100
    } else {
        completed.saturating_mul(100) / total
    }
}

impl<W: io::Write> ProgressMonitor for SideBandProgressMonitor<W> {
    fn begin_task(&mut self, title: &str, total: Option<u64>) {
        self.task = Some(TaskState {
            title: title.to_owned(),
            total,
            completed: 0,
            last_percent: None,
        });
        self.last_emit = None;
    }

    fn update(&mut self, completed: u64) {
        let interval_elapsed = self.interval_elapsed();
        let Some(task) = self.task.as_mut() else { return };
        task.completed = completed;
        let should_emit = match task.total {
            Some(total) => {
                let percent = percent_of(completed, total);
                let crossed = task.last_percent != Some(percent);
                if crossed {
                    task.last_percent = Some(percent);
                }
                crossed || interval_elapsed
            }
            None => interval_elapsed,
        };
        if should_emit {
            let line = Self::render(task, false);
            self.emit(&line, false);
        }
    }

    fn end_task(&mut self) {
        if let Some(task) = self.task.take() {
            let line = Self::render(&task, true);
            self.emit(&line, true);
        }
    }

    fn message(&mut self, text: &str) {
        let text = text.to_owned();
        self.emit(&text, true);
    }
}

const SPINNER_FRAMES: [char; 4] = ['|', '/', '-', '\\'];

/// Writes `\r<msg>... <frame>` to an arbitrary stream with the same 500ms
/// throttle, for interactive consoles rather than side-bands.
pub struct ProgressSpinner<W: io::Write> {
    out: W,
    message: String,
    frame: usize,
    interval: Duration,
    last_emit: Option<Instant>,
}

impl<W: io::Write> ProgressSpinner<W> {
    /// Create a spinner labelled with `message`.
    pub fn new(out: W, message: impl Into<String>) -> Self {
        Self {
            out,
            message: message.into(),
            frame: 0,
            interval: THROTTLE,
            last_emit: None,
        }
    }

    /// Override the throttle interval, mainly for tests.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Advance the spinner if the throttle interval elapsed.
    pub fn tick(&mut self) -> io::Result<()> {
        if self.last_emit.is_some_and(|at| at.elapsed() < self.interval) {
            return Ok(());
        }
        let glyph = SPINNER_FRAMES[self.frame % SPINNER_FRAMES.len()];
        self.frame += 1;
        write!(self.out, "\r{}... {glyph}", self.message)?;
        self.out.flush()?;
        self.last_emit = Some(Instant::now());
        Ok(())
    }

    /// Replace the spinner with a final status line.
    pub fn finish(mut self, status: &str) -> io::Result<()> {
        writeln!(self.out, "\r{}... {status}", self.message)?;
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn band_payloads(buf: &[u8]) -> Vec<String> {
        use wharf_pktline::{PacketLineRef, StreamingPeekableIter};
        let mut rd = StreamingPeekableIter::new(std::io::Cursor::new(buf.to_vec()), &[PacketLineRef::Flush], false);
        let mut out = Vec::new();
        while let Some(line) = rd.read_line() {
            if let PacketLineRef::Data(d) = line.unwrap().unwrap() {
                assert_eq!(d[0], 2, "progress goes to channel 2");
                out.push(String::from_utf8_lossy(&d[1..]).into_owned());
            }
        }
        out
    }

    #[test]
    fn bounded_task_emits_on_percent_boundaries() {
        let mut buf = Vec::new();
        {
            let mut monitor = SideBandProgressMonitor::new(&mut buf).with_interval(Duration::from_secs(3600));
            monitor.begin_task("Counting objects", Some(200));
            monitor.update(2); // 1%
            monitor.update(3); // still 1%, throttled
            monitor.update(4); // 2%
            monitor.end_task();
        }
        let lines = band_payloads(&buf);
        assert_eq!(
            lines,
            vec![
                "Counting objects: 1% (2/200)\r",
                "Counting objects: 2% (4/200)\r",
                "Counting objects: 100% (4/200), done\n",
            ]
        );
    }

    #[test]
    fn unbounded_task_is_time_throttled() {
        let mut buf = Vec::new();
        {
            let mut monitor = SideBandProgressMonitor::new(&mut buf).with_interval(Duration::from_secs(3600));
            monitor.begin_task("Receiving objects", None);
            monitor.update(1); // first update emits
            monitor.update(2); // throttled
            monitor.end_task();
        }
        let lines = band_payloads(&buf);
        assert_eq!(
            lines,
            vec!["Receiving objects: 1\r", "Receiving objects: 2, done\n"]
        );
    }

    #[test]
    fn cancellation_flag_is_observed() {
        let flag = Arc::new(AtomicBool::new(false));
        let monitor = CancellableMonitor::new(NoopMonitor, Arc::clone(&flag));
        assert!(!monitor.is_cancelled());
        flag.store(true, Ordering::Relaxed);
        assert!(monitor.is_cancelled());
    }

    #[test]
    fn spinner_writes_carriage_returns() {
        let mut buf = Vec::new();
        {
            let mut spinner = ProgressSpinner::new(&mut buf, "Resolving deltas").with_interval(Duration::ZERO);
            spinner.tick().unwrap();
            spinner.tick().unwrap();
            spinner.finish("done").unwrap();
        }
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("\rResolving deltas... |"));
        assert!(text.contains("\rResolving deltas... /"));
        assert!(text.ends_with("\rResolving deltas... done\n"));
    }
}
