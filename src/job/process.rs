//! Signals for runtime processes identified only by pid.

use crate::Result;

#[cfg(unix)]
mod imp {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    use crate::{Error, Result};

    fn pid(raw: u32) -> Option<Pid> {
        i32::try_from(raw).ok().filter(|p| *p > 0).map(Pid::from_raw)
    }

    pub fn is_alive(raw: u32) -> bool {
        let Some(pid) = pid(raw) else {
            return false;
        };
        // EPERM: exists, owned by someone else
        matches!(kill(pid, None), Ok(()) | Err(Errno::EPERM))
    }

    pub fn signal(raw: u32, signal: Signal) -> Result<()> {
        let Some(pid) = pid(raw) else {
            return Err(Error::Process(format!("invalid pid {}", raw)));
        };
        match kill(pid, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(Error::Process(format!("{} to {} failed: {}", signal, raw, e))),
        }
    }
}

/// Whether a process with this pid exists.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    imp::is_alive(pid)
}

/// Polite stop. A process that is already gone is not an error.
#[cfg(unix)]
pub fn terminate(pid: u32) -> Result<()> {
    imp::signal(pid, nix::sys::signal::Signal::SIGTERM)
}

#[cfg(unix)]
pub fn force_kill(pid: u32) -> Result<()> {
    imp::signal(pid, nix::sys::signal::Signal::SIGKILL)
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    true
}

#[cfg(not(unix))]
pub fn terminate(pid: u32) -> Result<()> {
    Err(crate::Error::Process(format!("cannot signal {} on this platform", pid)))
}

#[cfg(not(unix))]
pub fn force_kill(pid: u32) -> Result<()> {
    terminate(pid)
}
