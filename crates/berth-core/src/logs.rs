//! json-file container logs: one `{log, stream, time}` object per line in
//! `<state-dir>/<id>-json.log`.

use crate::concurrency::shutdown_requested;
use crate::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, warn};

const FOLLOW_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The line, newline included.
    pub log: String,
    pub stream: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogOptions {
    pub follow: bool,
    /// Only the last N entries of the existing log.
    pub tail: Option<usize>,
    pub timestamps: bool,
}

impl LogEntry {
    /// The line as `logs` prints it.
    pub fn render(&self, timestamps: bool) -> String {
        if timestamps {
            format!("{} {}", self.time.to_rfc3339(), self.log)
        } else {
            self.log.clone()
        }
    }
}

/// Copy `reader` line by line into `out` as json-file entries. Each entry
/// goes out in a single write so two streams can share one file.
pub fn copy_stream(reader: impl Read, stream: &str, out: &mut impl Write) -> io::Result<usize> {
    let mut reader = BufReader::new(reader);
    let mut count = 0;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        let entry = LogEntry {
            log: String::from_utf8_lossy(&buf).into_owned(),
            stream: stream.to_owned(),
            time: Utc::now(),
        };
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        out.write_all(&line)?;
        out.flush()?;
        count += 1;
    }
    Ok(count)
}

/// Body of `berth internal logger`: append `input` to the json-file log.
pub fn run_json_logger(path: &Path, stream: &str, input: impl Read) -> Result<usize, CoreError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(copy_stream(input, stream, &mut file)?)
}

/// Body of `berth internal logger --driver journald`: forward to `systemd-cat`.
pub fn run_journald_logger(tag: &str, stream: &str, mut input: impl Read) -> Result<(), CoreError> {
    let priority = if stream == "stderr" { "err" } else { "info" };
    let mut child = Command::new("systemd-cat")
        .args(["-t", tag, "-p", priority])
        .stdin(Stdio::piped())
        .spawn()
        .map_err(|e| CoreError::Precondition(format!("failed to start systemd-cat: {e}")))?;
    if let Some(mut stdin) = child.stdin.take() {
        io::copy(&mut input, &mut stdin)?;
    }
    let status = child.wait()?;
    if !status.success() {
        warn!("systemd-cat exited with {status}");
    }
    Ok(())
}

fn parse_line(line: &str) -> Option<LogEntry> {
    let line = line.trim_end_matches('\n');
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(entry) => Some(entry),
        Err(e) => {
            debug!("skipping malformed log line: {e}");
            None
        }
    }
}

/// Emit the entries of a json-file log. With `follow`, keep polling for new
/// entries until `stop` returns true or Ctrl+C is pressed.
pub fn read_logs(
    path: &Path,
    opts: LogOptions,
    stop: &dyn Fn() -> bool,
    emit: &mut dyn FnMut(&LogEntry) -> io::Result<()>,
) -> Result<(), CoreError> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound && opts.follow => {
            while !path.exists() {
                if stop() || shutdown_requested() {
                    return Ok(());
                }
                std::thread::sleep(FOLLOW_INTERVAL);
            }
            File::open(path)?
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let mut content = String::new();
    file.read_to_string(&mut content)?;
    let mut offset = content.len() as u64;
    let (complete, mut pending) = match content.rfind('\n') {
        Some(i) => (&content[..=i], content[i + 1..].to_owned()),
        None => ("", content.clone()),
    };
    let entries: Vec<LogEntry> = complete.lines().filter_map(parse_line).collect();
    let skip = opts
        .tail
        .map_or(0, |n| entries.len().saturating_sub(n));
    for entry in &entries[skip..] {
        emit(entry)?;
    }

    if !opts.follow {
        return Ok(());
    }
    loop {
        let stopping = stop() || shutdown_requested();
        file.seek(SeekFrom::Start(offset))?;
        let mut chunk = String::new();
        let read = file.read_to_string(&mut chunk)?;
        offset += read as u64;
        pending.push_str(&chunk);
        while let Some(i) = pending.find('\n') {
            let line: String = pending.drain(..=i).collect();
            if let Some(entry) = parse_line(&line) {
                emit(&entry)?;
            }
        }
        if stopping {
            return Ok(());
        }
        std::thread::sleep(FOLLOW_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn entries_keep_newlines() {
        let mut out = Vec::new();
        let n = copy_stream("hello\nworld".as_bytes(), "stderr", &mut out).unwrap();
        assert_eq!(n, 2);
        let lines: Vec<LogEntry> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines[0].log, "hello\n");
        assert_eq!(lines[1].log, "world");
        assert_eq!(lines[0].stream, "stderr");
    }

    #[test]
    fn tail_limits_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c-json.log");
        run_json_logger(&path, "stdout", "a\nb\nc\n".as_bytes()).unwrap();
        run_json_logger(&path, "stderr", "d\n".as_bytes()).unwrap();

        let mut seen = Vec::new();
        let opts = LogOptions {
            tail: Some(2),
            ..LogOptions::default()
        };
        read_logs(&path, opts, &|| true, &mut |e| {
            seen.push(e.log.clone());
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec!["c\n", "d\n"]);
    }

    #[test]
    fn missing_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut count = 0;
        read_logs(
            &dir.path().join("none.log"),
            LogOptions::default(),
            &|| true,
            &mut |_| {
                count += 1;
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn follow_picks_up_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c-json.log");
        run_json_logger(&path, "stdout", "first\n".as_bytes()).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let writer = {
            let path = path.clone();
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(300));
                run_json_logger(&path, "stdout", "second\n".as_bytes()).unwrap();
                done.store(true, Ordering::SeqCst);
            })
        };
        let mut seen = Vec::new();
        let opts = LogOptions {
            follow: true,
            ..LogOptions::default()
        };
        read_logs(&path, opts, &|| done.load(Ordering::SeqCst), &mut |e| {
            seen.push(e.log.clone());
            Ok(())
        })
        .unwrap();
        writer.join().unwrap();
        assert_eq!(seen, vec!["first\n", "second\n"]);
    }

    #[test]
    fn timestamps_prefix() {
        let e = LogEntry {
            log: "x\n".to_owned(),
            stream: "stdout".to_owned(),
            time: Utc::now(),
        };
        assert!(e.render(true).ends_with(" x\n"));
        assert_eq!(e.render(false), "x\n");
    }
}
