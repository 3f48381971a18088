use crate::error::ProcessError;

/// Pids that must never receive a signal or priority change from us:
/// the kernel scheduler (0), init (1) and this daemon.
pub fn check(pid: u32, self_pid: u32) -> Result<(), ProcessError> {
    if pid == 0 || pid == 1 || pid == self_pid {
        log::warn!(
            target: "vitals_audit",
            "BLOCKED action on protected pid {pid}"
        );
        return Err(ProcessError::Protected(pid));
    }
    Ok(())
}
