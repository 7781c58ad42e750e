//! Small OS-liveness helper shared by the chunk store's startup cleanup and
//! the server/index lock files. Both need the same question answered: is
//! the process that created this temp file / lock still running?

/// Returns whether a process with the given PID currently exists.
///
/// On Unix, `kill(pid, 0)` sends no signal and only checks for existence
/// and permission — a well-known, safe liveness probe.
#[cfg(unix)]
pub fn process_exists(pid: u32) -> bool {
    // SAFETY: signal 0 sends nothing; it only validates that `pid` refers
    // to a process we have permission to signal. No memory is touched.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(windows)]
pub fn process_exists(pid: u32) -> bool {
    use std::process::Command;
    match Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH"])
        .output()
    {
        Ok(out) => {
            let stdout = String::from_utf8_lossy(&out.stdout);
            stdout.contains(&pid.to_string())
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_exists() {
        assert!(process_exists(std::process::id()));
    }

    #[test]
    fn implausible_pid_does_not_exist() {
        // PID 1 is typically init/launchd and alive, but an enormous PID
        // is essentially guaranteed not to correspond to a live process.
        assert!(!process_exists(u32::MAX - 1));
    }
}
