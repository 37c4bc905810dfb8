use std::{
    fmt,
    io::{self, Write},
    sync::Mutex,
    time::Duration,
};

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle, TermLike};

pub const FRAMES: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
/// indicatif shows the last tick string once the bar is finished.
const TICK_STRINGS: [&str; 11] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", " "];
pub const FRAME_INTERVAL: Duration = Duration::from_millis(100);

/// Lets indicatif draw on an arbitrary writer, such as a saved copy of the terminal.
struct WriterTerm {
    out: Mutex<Box<dyn Write + Send>>,
}

impl fmt::Debug for WriterTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterTerm").finish_non_exhaustive()
    }
}

impl WriterTerm {
    fn write_raw(&self, s: &str) -> io::Result<()> {
        let mut out = self
            .out
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "terminal writer poisoned"))?;
        out.write_all(s.as_bytes())
    }

    fn escape(&self, n: usize, code: char) -> io::Result<()> {
        if n == 0 {
            return Ok(());
        }
        self.write_raw(&format!("\x1b[{n}{code}"))
    }
}

impl TermLike for WriterTerm {
    fn width(&self) -> u16 {
        80
    }

    fn move_cursor_up(&self, n: usize) -> io::Result<()> {
        self.escape(n, 'A')
    }

    fn move_cursor_down(&self, n: usize) -> io::Result<()> {
        self.escape(n, 'B')
    }

    fn move_cursor_right(&self, n: usize) -> io::Result<()> {
        self.escape(n, 'C')
    }

    fn move_cursor_left(&self, n: usize) -> io::Result<()> {
        self.escape(n, 'D')
    }

    fn write_line(&self, s: &str) -> io::Result<()> {
        self.write_raw(s)?;
        self.write_raw("\n")
    }

    fn write_str(&self, s: &str) -> io::Result<()> {
        self.write_raw(s)
    }

    fn clear_line(&self) -> io::Result<()> {
        self.write_raw("\r\x1b[2K")
    }

    fn flush(&self) -> io::Result<()> {
        let mut out = self
            .out
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "terminal writer poisoned"))?;
        out.flush()
    }
}

/// Animated busy indicator drawn by indicatif's ticker thread while a blocking call runs.
#[derive(Debug, Clone)]
pub struct ProgressIndicator {
    tick_strings: &'static [&'static str],
    interval: Duration,
}

impl Default for ProgressIndicator {
    fn default() -> Self {
        Self {
            tick_strings: &TICK_STRINGS,
            interval: FRAME_INTERVAL,
        }
    }
}

impl ProgressIndicator {
    /// Start drawing to `out`. The animation runs until the guard is stopped or dropped.
    pub fn start<W: Write + Send + 'static>(&self, out: W) -> SpinnerGuard {
        let term = WriterTerm {
            out: Mutex::new(Box::new(out)),
        };
        let bar = ProgressBar::with_draw_target(None, ProgressDrawTarget::term_like(Box::new(term)));
        bar.set_style(ProgressStyle::default_spinner().tick_strings(self.tick_strings));
        bar.enable_steady_tick(self.interval);
        SpinnerGuard { bar }
    }

    /// Run `f` with the indicator animating, then stop it whatever the outcome.
    ///
    /// The return value of `f` is passed through unchanged, and a panic inside
    /// `f` still stops the animation before it propagates.
    pub fn wrap<W, T>(&self, out: W, f: impl FnOnce() -> T) -> T
    where
        W: Write + Send + 'static,
    {
        let _guard = self.start(out);
        f()
    }
}

/// Stops the ticker thread and clears the spinner line when dropped.
pub struct SpinnerGuard {
    bar: ProgressBar,
}

impl SpinnerGuard {
    /// Stop the animation. Joins the ticker thread before clearing the line.
    pub fn stop(&self) {
        if !self.bar.is_finished() {
            self.bar.disable_steady_tick();
            self.bar.finish_and_clear();
        }
    }
}

impl Drop for SpinnerGuard {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Convenience wrapper around [`ProgressIndicator::wrap`] with the default frames.
pub fn with_spinner<W, T>(out: W, f: impl FnOnce() -> T) -> T
where
    W: Write + Send + 'static,
{
    ProgressIndicator::default().wrap(out, f)
}
