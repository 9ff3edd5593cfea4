use anyhow::Context as _;
use chrono::{Local, NaiveDate};
use std::fs::{self, File, OpenOptions};
use std::io::{Read as _, Seek, SeekFrom, Write as _};
use std::path::{Path, PathBuf};

/// Per-day append-only log file shared by the supervisor and the worker.
///
/// Files are named `<service>_<YYYYMMDD>.log` under the log directory.
#[derive(Debug, Clone)]
pub struct LogSink {
    dir: PathBuf,
    service: String,
}

impl LogSink {
    pub fn new(dir: impl Into<PathBuf>, service: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            service: service.into(),
        }
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("{}_{}.log", self.service, date.format("%Y%m%d")))
    }

    pub fn today(&self) -> PathBuf {
        self.path_for(Local::now().date_naive())
    }

    /// Open today's sink for appending, creating the directory if needed.
    pub fn open_append(&self) -> anyhow::Result<(PathBuf, File)> {
        fs::create_dir_all(&self.dir).with_context(|| format!("create_dir_all {}", self.dir.display()))?;
        let path = self.today();
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {} for append", path.display()))?;
        Ok((path, f))
    }

    fn line(&self, component: &str, msg: &str) -> String {
        let ts = Local::now().format("%Y-%m-%d_%H:%M:%S%.3f");
        format!("{ts} [{component}] app={} {msg}\n", self.service)
    }

    fn append(&self, line: &str) {
        // One write per line on an O_APPEND handle keeps lines whole next to worker output.
        let res = self
            .open_append()
            .and_then(|(p, mut f)| f.write_all(line.as_bytes()).with_context(|| format!("write {}", p.display())));
        if let Err(e) = res {
            tracing::warn!("log sink unavailable: {e:#}");
        }
    }

    pub fn info(&self, component: &str, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        tracing::info!(component, app = %self.service, "{msg}");
        self.append(&self.line(component, msg));
    }

    pub fn warn(&self, component: &str, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        tracing::warn!(component, app = %self.service, "{msg}");
        self.append(&self.line(component, msg));
    }

    pub fn error(&self, component: &str, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        tracing::error!(component, app = %self.service, "{msg}");
        self.append(&self.line(component, msg));
    }

    /// Last `n` lines of today's sink; a missing file yields no lines.
    pub fn tail(&self, n: usize) -> anyhow::Result<Vec<String>> {
        let path = self.today();
        match tail_lines(&path, n) {
            Ok(lines) => Ok(lines),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(vec![]),
            Err(e) => Err(e).with_context(|| format!("tail {}", path.display())),
        }
    }

    /// Date encoded in a sink file name belonging to this service.
    fn sink_date(&self, file_name: &str) -> Option<NaiveDate> {
        let rest = file_name.strip_prefix(&self.service)?.strip_prefix('_')?;
        let stamp = rest.strip_suffix(".log")?;
        if stamp.len() != 8 {
            return None;
        }
        NaiveDate::parse_from_str(stamp, "%Y%m%d").ok()
    }

    /// Delete this service's sinks dated more than `retention_days` before `today`.
    pub fn sweep(&self, retention_days: u32, today: NaiveDate) -> anyhow::Result<Vec<PathBuf>> {
        let cutoff = today - chrono::Duration::days(i64::from(retention_days));
        let rd = match fs::read_dir(&self.dir) {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e).with_context(|| format!("read_dir {}", self.dir.display())),
        };
        let mut removed = vec![];
        for entry in rd.flatten() {
            let p = entry.path();
            let Some(name) = p.file_name().and_then(|s| s.to_str()) else { continue };
            let Some(date) = self.sink_date(name) else { continue };
            if date < cutoff {
                match fs::remove_file(&p) {
                    Ok(()) => removed.push(p),
                    Err(e) => tracing::warn!(path = %p.display(), "failed to remove expired log: {e}"),
                }
            }
        }
        removed.sort();
        Ok(removed)
    }
}

fn tail_lines(path: &Path, n: usize) -> std::io::Result<Vec<String>> {
    if n == 0 {
        return Ok(vec![]);
    }
    let mut f = File::open(path)?;
    let meta = f.metadata()?;
    if !meta.is_file() {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"));
    }
    let len = meta.len();

    // Read backwards in chunks until enough newlines are buffered.
    let mut pos = len;
    let mut newline_count = 0usize;
    let mut chunks: Vec<Vec<u8>> = Vec::new();
    while pos > 0 && newline_count <= n {
        let read_size = std::cmp::min(8192u64, pos) as usize;
        pos -= read_size as u64;
        f.seek(SeekFrom::Start(pos))?;
        let mut buf = vec![0u8; read_size];
        f.read_exact(&mut buf)?;
        newline_count += buf.iter().filter(|&&b| b == b'\n').count();
        chunks.push(buf);
        if chunks.len() > 512 {
            break;
        }
    }
    chunks.reverse();
    let data = chunks.concat();
    let text = String::from_utf8_lossy(&data);
    let lines: Vec<&str> = text.split_terminator('\n').collect();
    let skip = lines.len().saturating_sub(n);
    Ok(lines[skip..].iter().map(|s| s.to_string()).collect())
}
