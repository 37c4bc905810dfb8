//! Silencing native output written straight to the process file descriptors.
//!
//! The inference engine writes its load logs to fds 1 and 2 directly, so
//! redirecting Rust's `stdout()` handle is not enough. [`OutputSuppressor`]
//! points the descriptors themselves at the null device and puts them back
//! when dropped, including during unwinding.

use std::io::{self, Write};

use tracing::warn;

#[cfg(unix)]
mod imp {
    use std::{
        fs::File,
        io,
        os::fd::{AsRawFd, FromRawFd, RawFd},
    };

    fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
        if ret == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret)
        }
    }

    /// One descriptor pointed at `/dev/null`, with a saved copy of where it used to go.
    pub struct FdRedirect {
        fd: RawFd,
        saved: RawFd,
    }

    impl FdRedirect {
        pub fn to_null(fd: RawFd) -> io::Result<Self> {
            let null = File::options().write(true).open("/dev/null")?;
            let saved = cvt(unsafe { libc::dup(fd) })?;
            if let Err(e) = cvt(unsafe { libc::dup2(null.as_raw_fd(), fd) }) {
                unsafe { libc::close(saved) };
                return Err(e);
            }
            Ok(Self { fd, saved })
        }
    }

    impl Drop for FdRedirect {
        fn drop(&mut self) {
            unsafe {
                libc::dup2(self.saved, self.fd);
                libc::close(self.saved);
            }
        }
    }

    pub const STDOUT: RawFd = libc::STDOUT_FILENO;
    pub const STDERR: RawFd = libc::STDERR_FILENO;

    pub fn dup_stdout() -> io::Result<File> {
        let fd = cvt(unsafe { libc::dup(STDOUT) })?;
        Ok(unsafe { File::from_raw_fd(fd) })
    }
}

#[cfg(unix)]
pub use imp::FdRedirect;

fn flush_std() {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
}

/// Scoped guard that discards everything written to stdout and stderr.
///
/// Buffered Rust output is flushed on entry and exit so nothing written before
/// the scope is lost and nothing written inside it leaks out afterwards.
/// Guards nest: an inner guard restores to the null device, the outer one to
/// the terminal. On platforms without `dup2` this is a no-op.
pub struct OutputSuppressor {
    #[cfg(unix)]
    redirects: Vec<FdRedirect>,
}

impl OutputSuppressor {
    #[cfg(unix)]
    pub fn new() -> io::Result<Self> {
        flush_std();
        let mut redirects = Vec::with_capacity(2);
        for fd in [imp::STDOUT, imp::STDERR] {
            redirects.push(FdRedirect::to_null(fd)?);
        }
        Ok(Self { redirects })
    }

    #[cfg(not(unix))]
    pub fn new() -> io::Result<Self> {
        tracing::debug!("Output suppression is not supported on this platform");
        Ok(Self {})
    }
}

impl Drop for OutputSuppressor {
    fn drop(&mut self) {
        flush_std();
        // Restore in reverse so stderr comes back before stdout.
        #[cfg(unix)]
        while let Some(redirect) = self.redirects.pop() {
            drop(redirect);
        }
    }
}

/// Run `f` with stdout and stderr silenced. If the descriptors cannot be
/// redirected, `f` still runs, just unsilenced.
pub fn suppressed<T>(f: impl FnOnce() -> T) -> T {
    let _guard = match OutputSuppressor::new() {
        Ok(guard) => Some(guard),
        Err(e) => {
            warn!("Could not silence engine output: {e}");
            None
        }
    };
    f()
}

/// A handle to the terminal that stays connected while an [`OutputSuppressor`]
/// is active. Take it before entering the suppressed scope.
pub fn terminal_writer() -> io::Result<Box<dyn Write + Send>> {
    #[cfg(unix)]
    {
        Ok(Box::new(imp::dup_stdout()?))
    }
    #[cfg(not(unix))]
    {
        Ok(Box::new(io::stdout()))
    }
}


#[cfg(all(test, unix))]
mod tests {
    use std::{
        io::{Read, Seek, SeekFrom, Write},
        os::fd::AsRawFd,
        panic::{self, AssertUnwindSafe},
    };

    use super::{
        test_support::{write_fd, CapturedStdout},
        *,
    };

    fn contents(mut file: &std::fs::File) -> String {
        let mut out = String::new();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn writes_inside_the_scope_are_discarded() {
        let file = tempfile::tempfile().unwrap();
        (&file).write_all(b"before\n").unwrap();
        {
            let _redirect = FdRedirect::to_null(file.as_raw_fd()).unwrap();
            (&file).write_all(b"hidden\n").unwrap();
        }
        (&file).write_all(b"after\n").unwrap();
        assert_eq!(contents(&file), "before\nafter\n");
    }

    #[test]
    fn descriptor_is_restored_after_a_panic() {
        let file = tempfile::tempfile().unwrap();
        let fd = file.as_raw_fd();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let _redirect = FdRedirect::to_null(fd).unwrap();
            (&file).write_all(b"hidden\n").unwrap();
            panic!("engine blew up");
        }));
        assert!(result.is_err());
        (&file).write_all(b"after\n").unwrap();
        assert_eq!(contents(&file), "after\n");
    }

    #[test]
    fn nested_redirects_unwind_in_order() {
        let file = tempfile::tempfile().unwrap();
        let fd = file.as_raw_fd();
        {
            let _outer = FdRedirect::to_null(fd).unwrap();
            {
                let _inner = FdRedirect::to_null(fd).unwrap();
                (&file).write_all(b"inner\n").unwrap();
            }
            (&file).write_all(b"outer\n").unwrap();
        }
        (&file).write_all(b"visible\n").unwrap();
        assert_eq!(contents(&file), "visible\n");
    }

    #[test]
    fn only_the_saved_terminal_gets_through() {
        let captured = CapturedStdout::new();
        let mut terminal = terminal_writer().unwrap();
        write_fd(imp::STDOUT, "before\n");
        {
            let _quiet = OutputSuppressor::new().unwrap();
            write_fd(imp::STDOUT, "LOAD-NOISE-OUT\n");
            write_fd(imp::STDERR, "LOAD-NOISE-ERR\n");
            terminal.write_all(b"spinner\n").unwrap();
            terminal.flush().unwrap();
        }
        write_fd(imp::STDOUT, "after\n");
        let out = captured.contents();
        assert!(!out.contains("LOAD-NOISE"), "{out:?}");
        let at = |needle: &str| out.find(needle).unwrap();
        assert!(at("before\n") < at("spinner\n"));
        assert!(at("spinner\n") < at("after\n"));
    }

    #[test]
    fn nested_suppressors_restore_the_terminal() {
        let captured = CapturedStdout::new();
        {
            let _outer = OutputSuppressor::new().unwrap();
            {
                let _inner = OutputSuppressor::new().unwrap();
                write_fd(imp::STDOUT, "HIDDEN-INNER\n");
            }
            write_fd(imp::STDOUT, "HIDDEN-OUTER\n");
        }
        write_fd(imp::STDOUT, "visible\n");
        let out = captured.contents();
        assert!(out.contains("visible\n"));
        assert!(!out.contains("HIDDEN"), "{out:?}");
    }

    #[test]
    fn suppressed_returns_the_closure_value() {
        let _captured = CapturedStdout::new();
        assert_eq!(suppressed(|| 40 + 2), 42);
    }
}
