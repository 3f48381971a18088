//! Where process data comes from.
//!
//! CPU percentages are deltas, so a listing needs two refreshes: `prime`
//! establishes the baseline and `read`, called a short while later,
//! measures against it. The two passes are not atomic; processes that
//! exit in between are simply absent from `read`.

use super::{ProcessRecord, ProcessStats, ProcessStatus, Signal};
use crate::error::ProcessError;
use chrono::DateTime;
use log::debug;
use std::io;
use std::path::Path;
use sysinfo::{Pid, Process, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind, Users};

pub const CMDLINE_MAX_CHARS: usize = 100;

pub trait ProcessSource: Send {
    /// First pass: refresh CPU counters without producing records.
    fn prime(&mut self);
    /// Second pass: everything alive now.
    fn read(&mut self) -> Vec<ProcessRecord>;
    fn read_one(&mut self, pid: u32) -> Result<ProcessRecord, ProcessError>;
    /// Counts by state from a single enumeration.
    fn stats(&mut self) -> ProcessStats;
    fn signal(&mut self, pid: u32, signal: Signal) -> Result<(), ProcessError>;
    fn renice(&mut self, pid: u32, nice: i32) -> Result<(), ProcessError>;
}

/// Live processes through sysinfo, with procfs for state counts and libc
/// for signals.
pub struct SysinfoSource {
    sys: System,
    users: Users,
}

impl SysinfoSource {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        Self {
            sys,
            users: Users::new_with_refreshed_list(),
        }
    }

    fn refresh_kind() -> ProcessRefreshKind {
        ProcessRefreshKind::nothing()
            .with_cpu()
            .with_memory()
            .with_user(UpdateKind::OnlyIfNotSet)
            .with_cmd(UpdateKind::OnlyIfNotSet)
            .with_tasks()
    }

    fn record(&self, process: &Process) -> ProcessRecord {
        let total = self.sys.total_memory();
        let memory = process.memory();
        let owner = process
            .user_id()
            .and_then(|uid| self.users.get_user_by_id(uid))
            .map(|user| user.name().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let cmdline = process
            .cmd()
            .iter()
            .map(|arg| arg.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");

        ProcessRecord {
            pid: process.pid().as_u32(),
            name: process.name().to_string_lossy().into_owned(),
            status: ProcessStatus::from(process.status()),
            cpu_percent: process.cpu_usage().max(0.0),
            memory_percent: if total == 0 {
                0.0
            } else {
                (memory as f64 / total as f64 * 100.0) as f32
            },
            memory_mb: memory as f64 / (1024.0 * 1024.0),
            owner,
            started_at: DateTime::from_timestamp(process.start_time() as i64, 0),
            threads: process.tasks().map(|tasks| tasks.len()).unwrap_or(0).max(1),
            cmdline: truncate_chars(&cmdline, CMDLINE_MAX_CHARS),
        }
    }
}

impl Default for SysinfoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSource for SysinfoSource {
    fn prime(&mut self) {
        self.sys
            .refresh_processes_specifics(ProcessesToUpdate::All, true, Self::refresh_kind());
    }

    fn read(&mut self) -> Vec<ProcessRecord> {
        self.sys.refresh_memory();
        self.sys
            .refresh_processes_specifics(ProcessesToUpdate::All, true, Self::refresh_kind());
        self.sys
            .processes()
            .values()
            .filter(|process| process.thread_kind().is_none())
            .map(|process| self.record(process))
            .collect()
    }

    fn read_one(&mut self, pid: u32) -> Result<ProcessRecord, ProcessError> {
        let sys_pid = Pid::from_u32(pid);
        self.sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            Self::refresh_kind(),
        );
        match self.sys.process(sys_pid) {
            Some(process) => Ok(self.record(process)),
            // Listed by the kernel but unreadable for us.
            None if Path::new("/proc").join(pid.to_string()).exists() => {
                Err(ProcessError::PermissionDenied(pid))
            }
            None => Err(ProcessError::NotFound(pid)),
        }
    }

    fn stats(&mut self) -> ProcessStats {
        let mut stats = ProcessStats::default();
        let processes = match procfs::process::all_processes() {
            Ok(processes) => processes,
            Err(err) => {
                debug!("[processes] /proc unavailable: {err}");
                return stats;
            }
        };
        for process in processes.flatten() {
            // Exited between listing and reading.
            let Ok(stat) = process.stat() else { continue };
            stats.add(
                ProcessStatus::from_state_char(stat.state),
                stat.num_threads.max(0) as u64,
            );
        }
        stats
    }

    fn signal(&mut self, pid: u32, signal: Signal) -> Result<(), ProcessError> {
        let raw_pid = i32::try_from(pid).map_err(|_| ProcessError::NotFound(pid))?;
        let signum = match signal {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(raw_pid, signum) };
        if rc == 0 {
            Ok(())
        } else {
            Err(os_error(pid, io::Error::last_os_error()))
        }
    }

    fn renice(&mut self, pid: u32, nice: i32) -> Result<(), ProcessError> {
        // SAFETY: setpriority(2) has no memory-safety preconditions.
        let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, pid as libc::id_t, nice) };
        if rc == 0 {
            Ok(())
        } else {
            Err(os_error(pid, io::Error::last_os_error()))
        }
    }
}

fn os_error(pid: u32, err: io::Error) -> ProcessError {
    match err.raw_os_error() {
        Some(libc::ESRCH) => ProcessError::NotFound(pid),
        Some(libc::EPERM) | Some(libc::EACCES) => ProcessError::PermissionDenied(pid),
        _ => ProcessError::Os(err),
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

impl From<sysinfo::ProcessStatus> for ProcessStatus {
    fn from(status: sysinfo::ProcessStatus) -> Self {
        use sysinfo::ProcessStatus as S;
        match status {
            S::Run | S::Waking => ProcessStatus::Running,
            S::Sleep | S::Idle | S::UninterruptibleDiskSleep | S::Parked | S::LockBlocked => {
                ProcessStatus::Sleeping
            }
            S::Stop | S::Tracing => ProcessStatus::Stopped,
            S::Zombie | S::Dead => ProcessStatus::Zombie,
            _ => ProcessStatus::Unknown,
        }
    }
}
