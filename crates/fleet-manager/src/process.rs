//! OS process-table queries.

use std::io;

/// Liveness checks against the OS process table.
pub trait ProcessProbe: Send + Sync {
    /// Whether a process with `pid` exists.
    fn is_alive(&self, pid: u32) -> bool;

    /// Whether `pid` exists and its command line mentions `name`.
    fn is_running(&self, pid: u32, name: &str) -> bool;
}

/// Probe backed by `kill(pid, 0)` and `/proc/<pid>/cmdline`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcFs;

impl ProcessProbe for ProcFs {
    fn is_alive(&self, pid: u32) -> bool {
        // pid 0 and negative pids address process groups.
        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // SAFETY: signal 0 performs only the existence and permission check.
        let rc = unsafe { libc::kill(pid, 0) };
        rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    fn is_running(&self, pid: u32, name: &str) -> bool {
        if !self.is_alive(pid) {
            return false;
        }
        match std::fs::read(format!("/proc/{pid}/cmdline")) {
            Ok(raw) => raw
                .split(|&b| b == 0)
                .any(|arg| String::from_utf8_lossy(arg).contains(name)),
            // No procfs: trust the signal check.
            Err(_) => true,
        }
    }
}

/// Ask `pid` to shut down with SIGTERM.
pub fn terminate(pid: u32) -> io::Result<()> {
    let pid = i32::try_from(pid)
        .ok()
        .filter(|&p| p > 0)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid pid"))?;
    // SAFETY: plain signal delivery to a positive pid.
    if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        assert!(ProcFs.is_alive(std::process::id()));
    }

    #[test]
    fn reserved_pids_are_never_alive() {
        assert!(!ProcFs.is_alive(0));
        assert!(!ProcFs.is_alive(u32::MAX));
    }

    #[test]
    fn running_check_matches_command_line() {
        let pid = std::process::id();
        let exe = std::env::current_exe().unwrap();
        let name = exe.file_name().unwrap().to_string_lossy().to_string();
        assert!(ProcFs.is_running(pid, &name));
        if std::path::Path::new("/proc/self/cmdline").exists() {
            assert!(!ProcFs.is_running(pid, "definitely-not-this-binary"));
        }
    }

    #[test]
    fn terminate_rejects_invalid_pid() {
        assert!(terminate(0).is_err());
    }
}
