//! Process-tree resource calculator backed by the /proc filesystem.
//!
//! Each update rescans `/proc`, rebuilds the descendant tree of the root pid
//! and sums resident memory and cumulative CPU time across it. CPU usage is a
//! rate, so the calculator keeps the previous cumulative CPU time and sample
//! instant between updates.

use ahash::AHashMap as HashMap;
use once_cell::sync::Lazy;
use rayon::prelude::*;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, trace};

use crate::resolver::parse_stat_field;

/// Returned by the readers while no value can be computed yet.
pub const UNAVAILABLE: i64 = -1;

/// Kernel clock ticks per second, used to convert utime/stime jiffies.
static CLOCK_TICKS: Lazy<i64> = Lazy::new(|| {
    // SAFETY: sysconf has no memory-safety preconditions.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as i64
    } else {
        100
    }
});

/// Page size in bytes, used to convert the rss page count.
static PAGE_SIZE: Lazy<i64> = Lazy::new(|| {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as i64
    } else {
        4096
    }
});

/// Errors raised by a single process-tree refresh.
#[derive(Error, Debug)]
pub enum SampleError {
    #[error("failed to scan {path}: {source}")]
    ProcUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("process {0} is no longer running")]
    ProcessGone(u32),
}

/// A refreshable resource calculator for one process tree.
pub trait ProcessTreeSource: Send {
    /// Root pid of the tree.
    fn pid(&self) -> u32;

    /// Rescans the tree and updates the cached readings.
    fn update_process_tree(&mut self) -> Result<(), SampleError>;

    /// Resident memory of the whole tree in bytes, or [`UNAVAILABLE`].
    fn rss_memory_size(&self) -> i64;

    /// CPU usage of the whole tree since the previous update, in percent of
    /// one core, or [`UNAVAILABLE`] before two updates have been taken.
    fn cpu_usage_percent(&self) -> f32;
}

/// Fields of `/proc/<pid>/stat` the calculator needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    pub pid: u32,
    pub ppid: u32,
    pub utime: u64,
    pub stime: u64,
    pub rss_pages: i64,
}

/// Parses pid, ppid, utime, stime and rss out of a stat record.
pub fn parse_proc_stat(content: &str) -> Result<ProcStat, String> {
    let field = |i: usize| parse_stat_field(content, i);
    let pid = field(0)?
        .parse::<u32>()
        .map_err(|e| format!("invalid pid: {}", e))?;
    let ppid = field(3)?
        .parse::<u32>()
        .map_err(|e| format!("invalid ppid: {}", e))?;
    let utime = field(13)?.parse::<u64>().unwrap_or(0);
    let stime = field(14)?.parse::<u64>().unwrap_or(0);
    let rss_pages = field(23)?.parse::<i64>().unwrap_or(0);

    Ok(ProcStat {
        pid,
        ppid,
        utime,
        stime,
        rss_pages,
    })
}

/// Process-tree calculator reading `<proc_root>/<pid>/stat` for every pid.
#[derive(Debug)]
pub struct ProcfsProcessTree {
    root_pid: u32,
    proc_root: PathBuf,
    clock_ticks: i64,
    page_size: i64,
    tree: HashMap<u32, ProcStat>,
    cumulative_cpu_ms: Option<u64>,
    last_sample: Option<Instant>,
    cpu_percent: f32,
}

impl ProcfsProcessTree {
    pub fn new(root_pid: u32, proc_root: impl Into<PathBuf>) -> Self {
        Self {
            root_pid,
            proc_root: proc_root.into(),
            clock_ticks: *CLOCK_TICKS,
            page_size: *PAGE_SIZE,
            tree: HashMap::new(),
            cumulative_cpu_ms: None,
            last_sample: None,
            cpu_percent: UNAVAILABLE as f32,
        }
    }

    /// Overrides the clock-tick rate (jiffies per second).
    pub fn with_clock_ticks(mut self, ticks: i64) -> Self {
        self.clock_ticks = ticks.max(1);
        self
    }

    /// Overrides the page size in bytes.
    pub fn with_page_size(mut self, bytes: i64) -> Self {
        self.page_size = bytes.max(1);
        self
    }

    /// Pids currently part of the tree.
    pub fn members(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.tree.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Refresh using `now` as the sample instant.
    pub fn update_process_tree_at(&mut self, now: Instant) -> Result<(), SampleError> {
        let all = scan_proc(&self.proc_root)?;

        if !all.contains_key(&self.root_pid) {
            self.tree.clear();
            return Err(SampleError::ProcessGone(self.root_pid));
        }

        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for stat in all.values() {
            if stat.pid != self.root_pid {
                children.entry(stat.ppid).or_default().push(stat.pid);
            }
        }

        let mut tree = HashMap::new();
        let mut queue = VecDeque::from([self.root_pid]);
        while let Some(pid) = queue.pop_front() {
            if tree.contains_key(&pid) {
                continue;
            }
            if let Some(stat) = all.get(&pid) {
                tree.insert(pid, *stat);
            }
            if let Some(kids) = children.get(&pid) {
                queue.extend(kids.iter().copied());
            }
        }

        let jiffies: u64 = tree.values().map(|s| s.utime + s.stime).sum();
        let cpu_ms = jiffies.saturating_mul(1000) / self.clock_ticks as u64;

        self.cpu_percent = match (self.cumulative_cpu_ms, self.last_sample) {
            (Some(prev_ms), Some(prev_at)) => {
                let wall_ms = now.duration_since(prev_at).as_secs_f64() * 1000.0;
                if wall_ms > 0.0 {
                    // Negative when a child exited since the previous scan.
                    ((cpu_ms as f64 - prev_ms as f64) * 100.0 / wall_ms) as f32
                } else {
                    UNAVAILABLE as f32
                }
            }
            _ => UNAVAILABLE as f32,
        };

        trace!(
            "Process tree of {}: {} members, {} ms cpu",
            self.root_pid,
            tree.len(),
            cpu_ms
        );

        self.tree = tree;
        self.cumulative_cpu_ms = Some(cpu_ms);
        self.last_sample = Some(now);
        Ok(())
    }
}

impl ProcessTreeSource for ProcfsProcessTree {
    fn pid(&self) -> u32 {
        self.root_pid
    }

    fn update_process_tree(&mut self) -> Result<(), SampleError> {
        self.update_process_tree_at(Instant::now())
    }

    fn rss_memory_size(&self) -> i64 {
        if self.tree.is_empty() {
            return UNAVAILABLE;
        }
        self.tree
            .values()
            .map(|s| s.rss_pages.saturating_mul(self.page_size))
            .sum()
    }

    fn cpu_usage_percent(&self) -> f32 {
        self.cpu_percent
    }
}

/// Reads the stat record of every numeric entry below `root` in parallel.
/// Entries that vanish or fail to parse mid-scan are skipped.
fn scan_proc(root: &Path) -> Result<HashMap<u32, ProcStat>, SampleError> {
    let entries = fs::read_dir(root).map_err(|source| SampleError::ProcUnreadable {
        path: root.to_path_buf(),
        source,
    })?;

    let dirs: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|s| s.to_str())
                .map_or(false, |name| name.chars().all(|c| c.is_ascii_digit()))
        })
        .collect();

    let stats: Vec<(u32, ProcStat)> = dirs
        .par_iter()
        .filter_map(|dir| {
            let content = fs::read_to_string(dir.join("stat")).ok()?;
            match parse_proc_stat(&content) {
                Ok(stat) => Some((stat.pid, stat)),
                Err(e) => {
                    debug!("Skipping {}: {}", dir.display(), e);
                    None
                }
            }
        })
        .collect();

    Ok(stats.into_iter().collect())
}
