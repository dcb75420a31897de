//! # hammerscan
//!
//! Process-level plumbing of the `hammerscan` binary: logging setup, crash
//! isolation through a supervisor process, the wall-clock alarm and sizing of
//! the candidate mapping.
//!
//! ## Quickstart guide
//!
//! ```sh
//! cargo build --release
//! sudo target/release/hammerscan --fraction 0.25 --timeout 60 narrow
//! ```
//!
//! Physical frame numbers are only visible with `CAP_SYS_ADMIN`. Without them
//! every page of the mapping is skipped and the run fails early.

#[macro_use]
extern crate log;

use std::time::Duration;

use anyhow::{Context, bail};
use hammerscan_core::util::PAGE_SIZE;
use indicatif::MultiProgress;
use indicatif_log_bridge::LogWrapper;

/// Installs `env_logger` (default filter `info`) behind a progress bar bridge.
pub fn init_logging_with_progress() -> anyhow::Result<MultiProgress> {
    let logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).build();
    let progress = MultiProgress::new();
    LogWrapper::new(progress.clone(), logger).try_init()?;
    Ok(progress)
}

/// Forks a child that continues the run while the parent waits for it.
///
/// Returns `None` in the child. In the parent, returns the exit code of the
/// child once it terminated, with `128 + signal` for a child killed by a signal.
///
/// # Errors
///
/// Returns an error if fork or waitpid fail.
pub fn supervise() -> anyhow::Result<Option<i32>> {
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(std::io::Error::last_os_error()).context("fork failed");
    }
    if pid == 0 {
        return Ok(None);
    }
    info!("Supervising child {}", pid);
    let mut status = 0;
    loop {
        let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
        if ret == pid {
            break;
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err).context("waitpid failed");
        }
    }
    let code = if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        let signal = libc::WTERMSIG(status);
        error!("Child {} killed by signal {}", pid, signal);
        128 + signal
    } else {
        warn!("Child {} ended with status 0x{:x}", pid, status);
        1
    };
    info!("Child {} exited with {}", pid, code);
    Ok(Some(code))
}

/// Whether this process runs as init, which must never exit.
pub fn is_init() -> bool {
    std::process::id() == 1
}

/// Blocks the calling thread forever.
pub fn park_forever() -> ! {
    warn!("Running as PID 1, sleeping forever");
    loop {
        std::thread::park();
    }
}

/// Terminates the process with `SIGALRM` after `timeout`.
///
/// The timeout is rounded up to full seconds.
pub fn set_alarm(timeout: Duration) {
    let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
    let secs = u32::try_from(secs).unwrap_or(u32::MAX);
    info!("Setting alarm in {} s", secs);
    unsafe { libc::alarm(secs) };
}

/// Total physical memory in bytes.
///
/// # Errors
///
/// Returns an error if sysinfo fails.
pub fn physical_memory() -> anyhow::Result<usize> {
    let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
    if unsafe { libc::sysinfo(&mut info) } != 0 {
        return Err(std::io::Error::last_os_error()).context("sysinfo failed");
    }
    Ok(info.totalram as usize * info.mem_unit as usize)
}

/// Size of a mapping covering `fraction` of `total` bytes, rounded down to pages.
///
/// # Errors
///
/// Returns an error if `fraction` is not in `(0, 1]` or the result is smaller
/// than a page.
pub fn mapping_size(total: usize, fraction: f64) -> anyhow::Result<usize> {
    if !(fraction > 0.0 && fraction <= 1.0) {
        bail!("fraction must be in (0, 1], got {}", fraction);
    }
    let size = (total as f64 * fraction) as usize & !(PAGE_SIZE - 1);
    if size == 0 {
        bail!("{} of {} bytes is less than a page", fraction, total);
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_size() -> anyhow::Result<()> {
        assert_eq!(mapping_size(1 << 30, 0.25)?, 1 << 28);
        assert_eq!(mapping_size(3 * PAGE_SIZE + 100, 1.0)?, 3 * PAGE_SIZE);
        assert!(mapping_size(1 << 30, 0.0).is_err());
        assert!(mapping_size(1 << 30, 1.5).is_err());
        assert!(mapping_size(100, 0.5).is_err());
        Ok(())
    }

    #[test]
    fn test_physical_memory() -> anyhow::Result<()> {
        assert!(physical_memory()? >= PAGE_SIZE);
        Ok(())
    }
}
