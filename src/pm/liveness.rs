use crate::pm::pidstore::{PidRecord, PidStore, StoredRecord};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{getpgid, Pid};
use std::fs;

/// The slice of `/proc/<pid>/stat` the supervisor cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    pub state: char,
    pub utime_ticks: u64,
    pub stime_ticks: u64,
    pub start_ticks: u64,
}

pub fn read_proc_stat(pid: i32) -> Option<ProcStat> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_proc_stat(&stat)
}

fn parse_proc_stat(stat: &str) -> Option<ProcStat> {
    // comm (field 2) may contain spaces and parens; everything after the last ')' is fixed.
    let rparen = stat.rfind(')')?;
    let after = stat.get(rparen + 2..)?;
    let fields: Vec<&str> = after.split_whitespace().collect();
    // fields[0] is original field 3 (state); field N lives at index N-3.
    Some(ProcStat {
        state: fields.first()?.chars().next()?,
        utime_ticks: fields.get(11)?.parse().ok()?,
        stime_ticks: fields.get(12)?.parse().ok()?,
        start_ticks: fields.get(19)?.parse().ok()?,
    })
}

pub fn start_ticks(pid: i32) -> Option<u64> {
    read_proc_stat(pid).map(|s| s.start_ticks)
}

/// Command line with NUL separators turned into spaces.
pub fn cmdline(pid: i32) -> Option<String> {
    let raw = fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    if raw.is_empty() {
        return None;
    }
    let s = String::from_utf8_lossy(&raw);
    Some(s.trim_end_matches('\0').replace('\0', " "))
}

/// True when a process with this pid exists and has not exited.
///
/// EPERM still means "exists". Zombies count as dead: they have exited and
/// only wait for their parent to reap them.
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) | Err(Errno::EPERM) => !read_proc_stat(pid).is_some_and(|s| s.state == 'Z'),
        Err(_) => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Confirmed,
    /// The host gave us nothing to compare against.
    Unverifiable,
    Mismatch(String),
}

/// A live pid together with the record that named it.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    record: PidRecord,
}

impl ProcessHandle {
    pub fn new(record: PidRecord) -> Self {
        Self { record }
    }

    pub fn pid(&self) -> i32 {
        self.record.pid
    }

    pub fn is_alive(&self) -> bool {
        is_alive(self.record.pid)
    }

    /// Best-effort check that the pid still names the process we launched.
    pub fn verify(&self, identity_match: Option<&str>) -> Verdict {
        let pid = self.record.pid;
        let mut checked = false;

        if let (Some(recorded), Some(actual)) = (self.record.start_ticks, start_ticks(pid)) {
            if recorded != actual {
                return Verdict::Mismatch(format!(
                    "start_time_mismatch recorded_ticks={recorded} actual_ticks={actual}"
                ));
            }
            checked = true;
        }

        if let Some(needle) = identity_match {
            if let Some(cmd) = cmdline(pid) {
                if !cmd.contains(needle) {
                    return Verdict::Mismatch(format!("cmdline_mismatch expected={needle:?} actual={cmd:?}"));
                }
                checked = true;
            }
        }

        if checked {
            Verdict::Confirmed
        } else {
            Verdict::Unverifiable
        }
    }

    /// Deliver `sig` to the worker's process group when it leads one (it does
    /// after `setsid`), otherwise to the pid alone.
    pub fn signal(&self, sig: Signal) -> nix::Result<()> {
        let pid = Pid::from_raw(self.record.pid);
        match getpgid(Some(pid)) {
            Ok(pgid) if pgid == pid => killpg(pid, sig),
            _ => kill(pid, sig),
        }
    }
}

/// Tri-state view of the PID record.
#[derive(Debug, Clone)]
pub enum RecordState {
    Absent,
    /// The file exists but holds no pid; `content` is its first line.
    Unparsable { content: String },
    Stale { record: PidRecord, reason: String },
    Live(ProcessHandle),
}

pub fn probe(store: &PidStore, identity_match: Option<&str>) -> anyhow::Result<RecordState> {
    let record = match store.load()? {
        StoredRecord::Missing => return Ok(RecordState::Absent),
        StoredRecord::Unparsable(content) => return Ok(RecordState::Unparsable { content }),
        StoredRecord::Valid(record) => record,
    };
    if !is_alive(record.pid) {
        return Ok(RecordState::Stale {
            record,
            reason: "not_running".to_string(),
        });
    }
    let handle = ProcessHandle::new(record);
    match handle.verify(identity_match) {
        Verdict::Mismatch(reason) => Ok(RecordState::Stale {
            record: handle.record,
            reason: format!("pid_reused {reason}"),
        }),
        Verdict::Confirmed | Verdict::Unverifiable => Ok(RecordState::Live(handle)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const STAT: &str = "4321 (python3 main.py) S 1 4321 4321 0 -1 4194560 1200 0 0 0 \
                        150 30 0 0 20 0 3 0 987654 123456789 4000 18446744073709551615";

    #[test]
    fn parses_stat_with_spaces_in_comm() {
        let s = parse_proc_stat(STAT).unwrap();
        assert_eq!(s.state, 'S');
        assert_eq!(s.utime_ticks, 150);
        assert_eq!(s.stime_ticks, 30);
        assert_eq!(s.start_ticks, 987654);
        assert_eq!(parse_proc_stat("garbage"), None);
    }

    #[test]
    fn nonpositive_pids_are_never_alive() {
        assert!(!is_alive(0));
        assert!(!is_alive(-1));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn current_process_is_alive_and_confirmed() {
        let me = std::process::id() as i32;
        assert!(is_alive(me));
        let rec = PidRecord {
            pid: me,
            start_ticks: start_ticks(me),
            started_at: None,
        };
        assert_eq!(ProcessHandle::new(rec).verify(None), Verdict::Confirmed);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn reaped_and_zombie_children_are_dead() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        // Exited but not yet reaped: a zombie.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while is_alive(pid) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!is_alive(pid));
        child.wait().unwrap();
        assert!(!is_alive(pid));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn reused_pid_is_reported_stale() {
        let dir = tempfile::tempdir().unwrap();
        let store = PidStore::new(dir.path().join("bot.pid"));
        let me = std::process::id() as i32;
        let actual = start_ticks(me).unwrap();

        // Same pid, different start time: the pid was recycled after a reboot or crash.
        store
            .write(&PidRecord {
                pid: me,
                start_ticks: Some(actual + 1),
                started_at: None,
            })
            .unwrap();
        match probe(&store, None).unwrap() {
            RecordState::Stale { record, reason } => {
                assert_eq!(record.pid, me);
                assert!(reason.contains("start_time_mismatch"), "{reason}");
            }
            other => panic!("expected stale, got {other:?}"),
        }

        // Legacy record (no fingerprint) but the command line does not match.
        store.write(&PidRecord::new(me)).unwrap();
        match probe(&store, Some("definitely-not-this-binary")).unwrap() {
            RecordState::Stale { reason, .. } => assert!(reason.contains("cmdline_mismatch"), "{reason}"),
            other => panic!("expected stale, got {other:?}"),
        }

        // Legacy record with no identity hint is taken at face value.
        assert!(matches!(probe(&store, None).unwrap(), RecordState::Live(_)));
    }

    #[test]
    fn absent_and_dead_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = PidStore::new(dir.path().join("bot.pid"));
        assert!(matches!(probe(&store, None).unwrap(), RecordState::Absent));

        fs::write(store.path(), "garbage\n").unwrap();
        match probe(&store, None).unwrap() {
            RecordState::Unparsable { content } => assert_eq!(content, "garbage"),
            other => panic!("expected unparsable, got {other:?}"),
        }

        // pid_max on Linux is at most 2^22, so this pid cannot exist.
        store.write(&PidRecord::new(i32::MAX - 1)).unwrap();
        match probe(&store, None).unwrap() {
            RecordState::Stale { reason, .. } => assert_eq!(reason, "not_running"),
            other => panic!("expected stale, got {other:?}"),
        }
    }
}
