//! Resolution of the pid whose process tree is monitored.
//!
//! The agent is handed a token for the workload's launcher process. The
//! default strategy reads the launcher's `/proc/<pid>/stat` record and takes
//! field 3 of it; an explicit pid can be substituted when the caller already
//! knows the process to watch.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Field of the stat record holding the monitored pid.
const MONITORED_PID_FIELD: usize = 3;

/// Errors raised while mapping the launcher token to a pid.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("failed to read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed stat record for pid {pid}: {reason}")]
    Malformed { pid: u32, reason: String },
}

/// Strategy turning the externally supplied token into the pid to observe.
pub trait ProcessResolver: Send + Sync {
    fn resolve(&self) -> Result<u32, ResolveError>;

    /// Short label used in logs.
    fn describe(&self) -> String;
}

/// Reads field 3 of `<proc_root>/<launcher_pid>/stat`.
#[derive(Debug, Clone)]
pub struct StatResolver {
    launcher_pid: u32,
    proc_root: PathBuf,
}

impl StatResolver {
    pub fn new(launcher_pid: u32, proc_root: impl Into<PathBuf>) -> Self {
        Self {
            launcher_pid,
            proc_root: proc_root.into(),
        }
    }

    pub fn launcher_pid(&self) -> u32 {
        self.launcher_pid
    }
}

impl ProcessResolver for StatResolver {
    fn resolve(&self) -> Result<u32, ResolveError> {
        let path = self
            .proc_root
            .join(self.launcher_pid.to_string())
            .join("stat");
        let content = fs::read_to_string(&path).map_err(|source| ResolveError::Unreadable {
            path: path.clone(),
            source,
        })?;
        parse_stat_field(&content, MONITORED_PID_FIELD)
            .map_err(|reason| ResolveError::Malformed {
                pid: self.launcher_pid,
                reason,
            })?
            .parse::<u32>()
            .map_err(|e| ResolveError::Malformed {
                pid: self.launcher_pid,
                reason: format!("field {} is not a pid: {}", MONITORED_PID_FIELD, e),
            })
    }

    fn describe(&self) -> String {
        format!(
            "stat field {} of launcher pid {}",
            MONITORED_PID_FIELD, self.launcher_pid
        )
    }
}

/// Pid handed over directly by the caller.
#[derive(Debug, Clone, Copy)]
pub struct ExplicitPid(pub u32);

impl ProcessResolver for ExplicitPid {
    fn resolve(&self) -> Result<u32, ResolveError> {
        Ok(self.0)
    }

    fn describe(&self) -> String {
        format!("explicit pid {}", self.0)
    }
}

/// Returns whitespace-separated field `index` of a `/proc/<pid>/stat` line.
///
/// Field 1 is the parenthesised command name, which may itself contain
/// spaces or parentheses; fields from index 2 on are counted after the last
/// closing parenthesis.
pub(crate) fn parse_stat_field(content: &str, index: usize) -> Result<&str, String> {
    let line = content.lines().next().unwrap_or("").trim();
    if line.is_empty() {
        return Err("empty stat record".to_string());
    }

    match index {
        0 => line
            .split_whitespace()
            .next()
            .ok_or_else(|| "missing pid field".to_string()),
        1 => {
            let open = line.find('(').ok_or("missing '(' in comm field")?;
            let close = line.rfind(')').ok_or("missing ')' in comm field")?;
            if close < open {
                return Err("unbalanced comm field".to_string());
            }
            Ok(&line[open..=close])
        }
        _ => {
            let close = line.rfind(')').ok_or("missing ')' in comm field")?;
            line[close + 1..]
                .split_whitespace()
                .nth(index - 2)
                .ok_or_else(|| format!("stat record has no field {}", index))
        }
    }
}

/// True if `<proc_root>/<pid>` exists.
pub fn process_exists(proc_root: &Path, pid: u32) -> bool {
    proc_root.join(pid.to_string()).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_stat(root: &Path, pid: u32, content: &str) {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("stat"), content).unwrap();
    }

    #[test]
    fn test_resolves_field_three() {
        let tmp = TempDir::new().unwrap();
        write_stat(
            tmp.path(),
            4242,
            "4242 (bash) S 4100 4242 4100 0 -1 4194560 1201 0 0 0 1 0 0 0 20 0 1 0",
        );

        let resolver = StatResolver::new(4242, tmp.path());
        assert_eq!(resolver.resolve().unwrap(), 4100);
    }

    #[test]
    fn test_comm_with_spaces_does_not_shift_fields() {
        let tmp = TempDir::new().unwrap();
        write_stat(
            tmp.path(),
            77,
            "77 (python train (rank 0)) R 12 77 12 0 -1 0 0 0 0 0 5 3 0 0 20 0 4 0",
        );

        let resolver = StatResolver::new(77, tmp.path());
        assert_eq!(resolver.resolve().unwrap(), 12);
    }

    #[test]
    fn test_missing_process_is_unreadable() {
        let tmp = TempDir::new().unwrap();
        let resolver = StatResolver::new(99999, tmp.path());
        assert!(matches!(
            resolver.resolve(),
            Err(ResolveError::Unreadable { .. })
        ));
    }

    #[test]
    fn test_truncated_record_is_malformed() {
        let tmp = TempDir::new().unwrap();
        write_stat(tmp.path(), 5, "5 (sh) S");

        let resolver = StatResolver::new(5, tmp.path());
        assert!(matches!(
            resolver.resolve(),
            Err(ResolveError::Malformed { pid: 5, .. })
        ));
    }

    #[test]
    fn test_non_numeric_field_is_malformed() {
        let tmp = TempDir::new().unwrap();
        write_stat(tmp.path(), 6, "6 (sh) S abc 6 6");

        let resolver = StatResolver::new(6, tmp.path());
        assert!(matches!(
            resolver.resolve(),
            Err(ResolveError::Malformed { .. })
        ));
    }

    #[test]
    fn test_explicit_pid_passthrough() {
        assert_eq!(ExplicitPid(314).resolve().unwrap(), 314);
    }

    #[test]
    fn test_parse_stat_field_indices() {
        let line = "10 (a b) S 1 10 10 0 -1 0 0 0 0 0 7 9";
        assert_eq!(parse_stat_field(line, 0).unwrap(), "10");
        assert_eq!(parse_stat_field(line, 1).unwrap(), "(a b)");
        assert_eq!(parse_stat_field(line, 2).unwrap(), "S");
        assert_eq!(parse_stat_field(line, 3).unwrap(), "1");
        assert_eq!(parse_stat_field(line, 13).unwrap(), "7");
        assert_eq!(parse_stat_field(line, 14).unwrap(), "9");
        assert!(parse_stat_field("", 3).is_err());
    }
}
