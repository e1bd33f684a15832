use chrono::Utc;

/// Zero-signal existence check. Sends no signal; a process owned by another
/// user (EPERM) still counts as alive.
#[cfg(unix)]
pub fn pid_is_alive(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid <= 0 {
        return false;
    }
    matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(Errno::EPERM))
}

#[cfg(not(unix))]
pub fn pid_is_alive(_pid: i32) -> bool {
    true
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        assert!(pid_is_alive(std::process::id() as i32));
    }

    #[test]
    fn non_positive_pids_are_never_alive() {
        // kill(0) and kill(-1) address process groups, not a single pid.
        assert!(!pid_is_alive(0));
        assert!(!pid_is_alive(-1));
    }

    #[cfg(unix)]
    #[test]
    fn reaped_child_is_not_alive() {
        let mut child = std::process::Command::new("true")
            .spawn()
            .expect("spawn true");
        let pid = child.id() as i32;
        child.wait().expect("wait");
        assert!(!pid_is_alive(pid));
    }
}
