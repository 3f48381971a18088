//! Process inspection and control.

pub mod safety;
pub mod source;

pub use source::{ProcessSource, SysinfoSource};

use crate::error::ProcessError;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const NICE_RANGE: std::ops::RangeInclusive<i32> = -20..=19;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Sleeping,
    Stopped,
    Zombie,
    Unknown,
}

impl ProcessStatus {
    /// The state letter from /proc/<pid>/stat.
    pub fn from_state_char(state: char) -> Self {
        match state {
            'R' => ProcessStatus::Running,
            'S' | 'D' | 'I' | 'W' | 'P' => ProcessStatus::Sleeping,
            'T' | 't' => ProcessStatus::Stopped,
            'Z' | 'X' | 'x' => ProcessStatus::Zombie,
            _ => ProcessStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub name: String,
    pub status: ProcessStatus,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub memory_mb: f64,
    pub owner: String,
    pub started_at: Option<DateTime<Utc>>,
    pub threads: usize,
    pub cmdline: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStats {
    pub total: usize,
    pub running: usize,
    pub sleeping: usize,
    pub stopped: usize,
    pub zombie: usize,
    pub total_threads: u64,
}

impl ProcessStats {
    pub fn add(&mut self, status: ProcessStatus, threads: u64) {
        self.total += 1;
        self.total_threads += threads;
        match status {
            ProcessStatus::Running => self.running += 1,
            ProcessStatus::Sleeping => self.sleeping += 1,
            ProcessStatus::Stopped => self.stopped += 1,
            ProcessStatus::Zombie => self.zombie += 1,
            ProcessStatus::Unknown => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    Pid,
    Name,
    #[default]
    CpuPercent,
    MemoryPercent,
    MemoryMb,
}

impl SortKey {
    pub fn as_str(self) -> &'static str {
        match self {
            SortKey::Pid => "pid",
            SortKey::Name => "name",
            SortKey::CpuPercent => "cpu_percent",
            SortKey::MemoryPercent => "memory_percent",
            SortKey::MemoryMb => "memory_mb",
        }
    }

    fn compare(self, a: &ProcessRecord, b: &ProcessRecord) -> Ordering {
        match self {
            SortKey::Pid => a.pid.cmp(&b.pid),
            SortKey::Name => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
            SortKey::CpuPercent => a.cpu_percent.total_cmp(&b.cpu_percent),
            SortKey::MemoryPercent => a.memory_percent.total_cmp(&b.memory_percent),
            SortKey::MemoryMb => a.memory_mb.total_cmp(&b.memory_mb),
        }
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pid" => Ok(SortKey::Pid),
            "name" => Ok(SortKey::Name),
            "cpu" | "cpu_percent" => Ok(SortKey::CpuPercent),
            "memory" | "mem" | "memory_percent" => Ok(SortKey::MemoryPercent),
            "memory_mb" | "rss" => Ok(SortKey::MemoryMb),
            other => Err(format!(
                "unknown sort key '{other}' (expected pid, name, cpu_percent, memory_percent, memory_mb)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessQuery {
    pub filter: Option<String>,
    pub sort: SortKey,
    pub descending: bool,
    pub limit: Option<usize>,
}

impl Default for ProcessQuery {
    fn default() -> Self {
        Self {
            filter: None,
            sort: SortKey::CpuPercent,
            descending: true,
            limit: None,
        }
    }
}

impl ProcessQuery {
    pub fn top(sort: SortKey, n: usize) -> Self {
        Self {
            limit: Some(n),
            sort,
            ..Self::default()
        }
    }
}

/// Filter by case-insensitive name substring, sort, truncate. Ties on the
/// sort key are always broken by ascending pid.
pub fn apply_query(mut records: Vec<ProcessRecord>, query: &ProcessQuery) -> Vec<ProcessRecord> {
    if let Some(needle) = query.filter.as_deref().map(str::to_lowercase)
        && !needle.is_empty()
    {
        records.retain(|r| r.name.to_lowercase().contains(&needle));
    }
    records.sort_by(|a, b| {
        let primary = query.sort.compare(a, b);
        let primary = if query.descending {
            primary.reverse()
        } else {
            primary
        };
        primary.then_with(|| a.pid.cmp(&b.pid))
    });
    if let Some(limit) = query.limit {
        records.truncate(limit);
    }
    records
}

pub struct ProcessInspector<S = SysinfoSource> {
    source: S,
    prime_interval: Duration,
    self_pid: u32,
}

impl ProcessInspector<SysinfoSource> {
    pub fn system(prime_interval: Duration) -> Self {
        Self::new(SysinfoSource::new(), prime_interval)
    }
}

impl<S: ProcessSource> ProcessInspector<S> {
    pub fn new(source: S, prime_interval: Duration) -> Self {
        Self {
            source,
            prime_interval,
            self_pid: std::process::id(),
        }
    }

    /// Prime, wait, read, then filter/sort/limit. Blocks for the prime
    /// interval; async callers should use `spawn_blocking`.
    pub fn list(&mut self, query: &ProcessQuery) -> Vec<ProcessRecord> {
        self.source.prime();
        if !self.prime_interval.is_zero() {
            std::thread::sleep(self.prime_interval);
        }
        apply_query(self.source.read(), query)
    }

    pub fn get(&mut self, pid: u32) -> Option<ProcessRecord> {
        match self.source.read_one(pid) {
            Ok(record) => Some(record),
            Err(ProcessError::PermissionDenied(_)) => {
                warn!("[processes] access denied reading pid {pid}");
                None
            }
            Err(err) => {
                debug!("[processes] pid {pid}: {err}");
                None
            }
        }
    }

    /// SIGTERM. False for missing, protected or forbidden pids.
    pub fn terminate(&mut self, pid: u32) -> bool {
        self.send(pid, Signal::Term)
    }

    /// SIGKILL.
    pub fn kill(&mut self, pid: u32) -> bool {
        self.send(pid, Signal::Kill)
    }

    pub fn set_priority(&mut self, pid: u32, nice: i32) -> bool {
        let result = if NICE_RANGE.contains(&nice) {
            safety::check(pid, self.self_pid).and_then(|()| self.source.renice(pid, nice))
        } else {
            Err(ProcessError::InvalidNice(nice))
        };
        match result {
            Ok(()) => {
                log::info!(target: "vitals_audit", "RENICE pid={pid} nice={nice}");
                true
            }
            Err(err) => {
                warn!("[processes] renice {pid} to {nice} failed: {err}");
                false
            }
        }
    }

    fn send(&mut self, pid: u32, signal: Signal) -> bool {
        let result = safety::check(pid, self.self_pid).and_then(|()| self.source.signal(pid, signal));
        match result {
            Ok(()) => {
                log::warn!(target: "vitals_audit", "SIGNAL {signal:?} sent to pid={pid}");
                true
            }
            Err(ProcessError::NotFound(_)) => {
                debug!("[processes] pid {pid} not found for {signal:?}");
                false
            }
            Err(err) => {
                warn!("[processes] {signal:?} to {pid} failed: {err}");
                false
            }
        }
    }

    /// One enumeration, no CPU priming.
    pub fn stats(&mut self) -> ProcessStats {
        self.source.stats()
    }

    pub fn count(&mut self) -> usize {
        self.stats().total
    }

    /// Processes whose name contains `needle`, by pid. No CPU priming.
    pub fn by_name(&mut self, needle: &str) -> Vec<ProcessRecord> {
        let query = ProcessQuery {
            filter: Some(needle.to_string()),
            sort: SortKey::Pid,
            descending: false,
            limit: None,
        };
        apply_query(self.source.read(), &query)
    }

    /// SIGTERM every match; returns how many were signalled.
    pub fn kill_by_name(&mut self, needle: &str) -> usize {
        if needle.trim().is_empty() {
            return 0;
        }
        self.by_name(needle)
            .into_iter()
            .filter(|record| self.terminate(record.pid))
            .count()
    }

    pub fn top_cpu(&mut self, n: usize) -> Vec<ProcessRecord> {
        self.list(&ProcessQuery::top(SortKey::CpuPercent, n))
    }

    pub fn top_memory(&mut self, n: usize) -> Vec<ProcessRecord> {
        self.list(&ProcessQuery::top(SortKey::MemoryPercent, n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[derive(Default)]
    struct FakeSource {
        records: Vec<ProcessRecord>,
        primes: usize,
        reads: usize,
        signalled: Vec<(u32, Signal)>,
        reniced: Vec<(u32, i32)>,
        denied: BTreeSet<u32>,
    }

    impl FakeSource {
        fn with(records: Vec<ProcessRecord>) -> Self {
            Self {
                records,
                ..Default::default()
            }
        }

        fn lookup(&self, pid: u32) -> Result<&ProcessRecord, ProcessError> {
            if self.denied.contains(&pid) {
                return Err(ProcessError::PermissionDenied(pid));
            }
            self.records
                .iter()
                .find(|r| r.pid == pid)
                .ok_or(ProcessError::NotFound(pid))
        }
    }

    impl ProcessSource for FakeSource {
        fn prime(&mut self) {
            self.primes += 1;
        }

        fn read(&mut self) -> Vec<ProcessRecord> {
            self.reads += 1;
            self.records.clone()
        }

        fn read_one(&mut self, pid: u32) -> Result<ProcessRecord, ProcessError> {
            self.lookup(pid).cloned()
        }

        fn stats(&mut self) -> ProcessStats {
            let mut stats = ProcessStats::default();
            for r in &self.records {
                stats.add(r.status, r.threads as u64);
            }
            stats
        }

        fn signal(&mut self, pid: u32, signal: Signal) -> Result<(), ProcessError> {
            self.lookup(pid)?;
            self.signalled.push((pid, signal));
            Ok(())
        }

        fn renice(&mut self, pid: u32, nice: i32) -> Result<(), ProcessError> {
            self.lookup(pid)?;
            self.reniced.push((pid, nice));
            Ok(())
        }
    }

    fn proc(pid: u32, name: &str, cpu: f32, mem: f32) -> ProcessRecord {
        ProcessRecord {
            pid,
            name: name.to_string(),
            status: ProcessStatus::Running,
            cpu_percent: cpu,
            memory_percent: mem,
            memory_mb: f64::from(mem) * 10.0,
            owner: "root".to_string(),
            started_at: None,
            threads: 2,
            cmdline: String::new(),
        }
    }

    fn inspector(records: Vec<ProcessRecord>) -> ProcessInspector<FakeSource> {
        ProcessInspector::new(FakeSource::with(records), Duration::ZERO)
    }

    #[test]
    fn list_primes_then_reads() {
        let mut inspector = inspector(vec![proc(10, "a", 1.0, 1.0)]);
        inspector.list(&ProcessQuery::default());
        assert_eq!(inspector.source.primes, 1);
        assert_eq!(inspector.source.reads, 1);

        inspector.stats();
        assert_eq!(inspector.source.primes, 1);
    }

    #[test]
    fn cpu_desc_breaks_ties_by_pid() {
        let mut inspector = inspector(vec![
            proc(30, "c", 5.0, 1.0),
            proc(20, "b", 9.0, 1.0),
            proc(40, "d", 5.0, 1.0),
            proc(10, "a", 5.0, 1.0),
        ]);
        let listed = inspector.list(&ProcessQuery::default());
        let cpu: Vec<f32> = listed.iter().map(|r| r.cpu_percent).collect();
        assert!(cpu.windows(2).all(|w| w[0] >= w[1]));
        assert_eq!(
            listed.iter().map(|r| r.pid).collect::<Vec<_>>(),
            vec![20, 10, 30, 40]
        );
    }

    #[test]
    fn filter_is_case_insensitive_and_limit_applies() {
        let mut inspector = inspector(vec![
            proc(1, "Firefox", 1.0, 1.0),
            proc(2, "firefox-bin", 2.0, 1.0),
            proc(3, "bash", 3.0, 1.0),
        ]);
        let query = ProcessQuery {
            filter: Some("FIREFOX".into()),
            sort: SortKey::Name,
            descending: false,
            limit: Some(1),
        };
        let listed = inspector.list(&query);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "Firefox");
    }

    #[test]
    fn get_hides_missing_and_denied() {
        let mut inspector = inspector(vec![proc(10, "a", 1.0, 1.0), proc(11, "b", 1.0, 1.0)]);
        inspector.source.denied.insert(11);
        assert_eq!(inspector.get(10).map(|r| r.pid), Some(10));
        assert!(inspector.get(11).is_none());
        assert!(inspector.get(99).is_none());
    }

    #[test]
    fn terminate_nonexistent_is_false() {
        let mut inspector = inspector(vec![proc(10, "a", 1.0, 1.0)]);
        assert!(!inspector.terminate(99_999));
        assert!(inspector.terminate(10));
        assert!(inspector.kill(10));
        assert_eq!(
            inspector.source.signalled,
            vec![(10, Signal::Term), (10, Signal::Kill)]
        );
    }

    #[test]
    fn protected_pids_are_never_signalled() {
        let me = std::process::id();
        let mut inspector = inspector(vec![proc(1, "init", 0.0, 0.0), proc(me, "vitalsd", 0.0, 0.0)]);
        assert!(!inspector.kill(1));
        assert!(!inspector.terminate(me));
        assert!(!inspector.set_priority(1, 5));
        assert!(inspector.source.signalled.is_empty());
    }

    #[test]
    fn renice_validates_range() {
        let mut inspector = inspector(vec![proc(10, "a", 1.0, 1.0)]);
        assert!(!inspector.set_priority(10, 20));
        assert!(!inspector.set_priority(10, -21));
        assert!(inspector.set_priority(10, 5));
        assert_eq!(inspector.source.reniced, vec![(10, 5)]);
    }

    #[test]
    fn kill_by_name_counts_signalled() {
        let me = std::process::id();
        let mut inspector = inspector(vec![
            proc(10, "worker", 1.0, 1.0),
            proc(11, "Worker-2", 1.0, 1.0),
            proc(me, "worker-self", 1.0, 1.0),
            proc(12, "other", 1.0, 1.0),
        ]);
        assert_eq!(inspector.kill_by_name("worker"), 2);
        assert_eq!(inspector.kill_by_name(""), 0);
        assert_eq!(inspector.source.primes, 0);
    }

    #[test]
    fn top_and_stats() {
        let mut inspector = inspector(vec![
            proc(1, "a", 10.0, 50.0),
            proc(2, "b", 30.0, 5.0),
            proc(3, "c", 20.0, 20.0),
        ]);
        let top: Vec<u32> = inspector.top_cpu(2).iter().map(|r| r.pid).collect();
        assert_eq!(top, vec![2, 3]);
        let top: Vec<u32> = inspector.top_memory(1).iter().map(|r| r.pid).collect();
        assert_eq!(top, vec![1]);

        let stats = inspector.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.running, 3);
        assert_eq!(stats.total_threads, 6);
        assert_eq!(inspector.count(), 3);
    }

    #[test]
    fn state_letters_map_to_status() {
        assert_eq!(ProcessStatus::from_state_char('R'), ProcessStatus::Running);
        assert_eq!(ProcessStatus::from_state_char('D'), ProcessStatus::Sleeping);
        assert_eq!(ProcessStatus::from_state_char('t'), ProcessStatus::Stopped);
        assert_eq!(ProcessStatus::from_state_char('Z'), ProcessStatus::Zombie);
        assert_eq!(ProcessStatus::from_state_char('?'), ProcessStatus::Unknown);
    }

    #[test]
    fn sort_keys_parse_with_aliases() {
        assert_eq!("cpu".parse::<SortKey>(), Ok(SortKey::CpuPercent));
        assert_eq!("memory_mb".parse::<SortKey>(), Ok(SortKey::MemoryMb));
        assert!("uptime".parse::<SortKey>().is_err());
    }
}
