//! Log multiplexer: follow heterogeneous sources (files, container logs),
//! interleave by timestamp, and survive rotation and restarts.
//!
//! Non-following mode merges the tails of all sources by parsed timestamp.
//! Following mode runs one reader thread per source feeding a bounded
//! channel; producers block when the channel is full so no lines are lost.
use std::{
    fs::{self, File},
    io::{self, BufRead, BufReader, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    process::{Child, Stdio},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::{Receiver, RecvTimeoutError, SyncSender, sync_channel},
    },
    thread,
    time::Duration,
};

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{debug, warn};

use crate::{
    constants, container,
    error::StigmerError,
    paths::{self, Service, Transport},
};

/// A single log source to follow or snapshot.
#[derive(Debug, Clone)]
pub enum LogSource {
    /// On-disk log file.
    File {
        /// Component label shown in the merged output.
        component: String,
        /// Path of the log file.
        path: PathBuf,
    },
    /// Container logs addressed by container name.
    Container {
        /// Component label shown in the merged output.
        component: String,
        /// Stable container name used for re-resolution after restarts.
        name: String,
    },
}

impl LogSource {
    fn component(&self) -> &str {
        match self {
            LogSource::File { component, .. } | LogSource::Container { component, .. } => {
                component
            }
        }
    }
}

/// One parsed log line.
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    /// Timestamp parsed from the line, or inherited from the previous line.
    pub timestamp: DateTime<Utc>,
    /// Component label.
    pub component: String,
    /// Raw line text.
    pub text: String,
}

/// View options for `stigmer logs`.
#[derive(Debug, Clone)]
pub struct ViewOptions {
    /// Follow mode.
    pub follow: bool,
    /// Number of trailing lines per source.
    pub tail: usize,
}

/// Builds the log sources for a set of services. Containerized services are
/// addressed through the container runtime when a container is tracked,
/// falling back to their file logs.
pub fn sources_for(services: &[Service], include_stderr: bool) -> Vec<LogSource> {
    let mut sources = Vec::new();
    for service in services {
        match service.transport() {
            Transport::Subprocess => {
                sources.push(LogSource::File {
                    component: service.name().to_string(),
                    path: paths::log_file(*service),
                });
                if include_stderr {
                    sources.push(LogSource::File {
                        component: format!("{}:err", service.name()),
                        path: paths::err_file(*service),
                    });
                }
            }
            Transport::Container => {
                if paths::container_id_file(*service).exists() {
                    sources.push(LogSource::Container {
                        component: service.name().to_string(),
                        name: constants::AGENT_RUNNER_CONTAINER.to_string(),
                    });
                } else {
                    sources.push(LogSource::File {
                        component: service.name().to_string(),
                        path: paths::log_file(*service),
                    });
                }
            }
        }
    }
    sources
}

/// Renders the merged view to `out`. In follow mode this blocks until `stop`
/// is set; the flag is checked at every tick so an interrupt terminates the
/// view promptly.
pub fn view(
    sources: &[LogSource],
    options: &ViewOptions,
    stop: Arc<AtomicBool>,
    out: &mut (impl Write + Send),
) -> Result<(), StigmerError> {
    if options.follow {
        follow(sources, options.tail, stop, out)
    } else {
        snapshot(sources, options.tail, out)
    }
}

fn snapshot(
    sources: &[LogSource],
    tail: usize,
    out: &mut impl Write,
) -> Result<(), StigmerError> {
    let mut merged: Vec<(usize, usize, LogLine)> = Vec::new();

    for (source_index, source) in sources.iter().enumerate() {
        let lines = match source {
            LogSource::File { component, path } => tail_file(component, path, tail)?,
            LogSource::Container { component, name } => {
                tail_container(component, name, tail)
            }
        };
        for (sequence, line) in lines.into_iter().enumerate() {
            merged.push((source_index, sequence, line));
        }
    }

    // Stable key (timestamp, source, sequence): cross-source interleave by
    // timestamp while preserving each source's on-disk order.
    merged.sort_by(|a, b| {
        a.2.timestamp
            .cmp(&b.2.timestamp)
            .then(a.0.cmp(&b.0))
            .then(a.1.cmp(&b.1))
    });

    for (_, _, line) in merged {
        write_line(out, &line)?;
    }
    Ok(())
}

fn write_line(out: &mut impl Write, line: &LogLine) -> io::Result<()> {
    writeln!(
        out,
        "[{:<width$}] {}",
        line.component,
        line.text,
        width = constants::LOG_LABEL_WIDTH
    )
}

fn tail_file(component: &str, path: &Path, tail: usize) -> Result<Vec<LogLine>, StigmerError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let lines: Vec<&str> = contents.lines().collect();
    let start = lines.len().saturating_sub(tail);
    Ok(parse_lines(component, lines[start..].iter().copied()))
}

fn tail_container(component: &str, name: &str, tail: usize) -> Vec<LogLine> {
    let Some(id) = container::resolve_by_name(name) else {
        return Vec::new();
    };
    let output = match container::logs_command(&id, false, tail).output() {
        Ok(output) => output,
        Err(err) => {
            warn!("cannot read container logs for {name}: {err}");
            return Vec::new();
        }
    };
    // Container runtimes write service output to both streams.
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    parse_lines(component, text.lines())
}

fn parse_lines<'a>(component: &str, lines: impl Iterator<Item = &'a str>) -> Vec<LogLine> {
    let mut parsed = Vec::new();
    let mut previous = DateTime::<Utc>::MIN_UTC;
    for line in lines {
        let timestamp = parse_line_timestamp(line).unwrap_or(previous);
        previous = timestamp;
        parsed.push(LogLine {
            timestamp,
            component: component.to_string(),
            text: line.to_string(),
        });
    }
    parsed
}

/// Parses the leading timestamp of a log line. Accepts RFC3339 (the format
/// the personalities emit) and the space-separated variant some tools write.
pub fn parse_line_timestamp(line: &str) -> Option<DateTime<Utc>> {
    let token = line.split_whitespace().next()?;
    if let Ok(parsed) = DateTime::parse_from_rfc3339(token) {
        return Some(parsed.with_timezone(&Utc));
    }
    // "2026-01-02 15:04:05" with the time in the second token.
    let mut tokens = line.split_whitespace();
    let date = tokens.next()?;
    let time = tokens.next()?;
    let candidate = format!("{date} {time}");
    if let Ok(naive) = NaiveDateTime::parse_from_str(&candidate, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    None
}

fn follow(
    sources: &[LogSource],
    tail: usize,
    stop: Arc<AtomicBool>,
    out: &mut impl Write,
) -> Result<(), StigmerError> {
    let (sender, receiver): (SyncSender<LogLine>, Receiver<LogLine>) =
        sync_channel(constants::LOG_CHANNEL_CAPACITY);

    let mut readers = Vec::new();
    for source in sources {
        let sender = sender.clone();
        let stop = Arc::clone(&stop);
        let source = source.clone();
        let label = source.component().to_string();
        readers.push(
            thread::Builder::new()
                .name(format!("logs-{label}"))
                .spawn(move || match source {
                    LogSource::File { component, path } => {
                        follow_file(&component, &path, tail, sender, &stop)
                    }
                    LogSource::Container { component, name } => {
                        follow_container(&component, &name, tail, sender, &stop)
                    }
                })?,
        );
    }
    drop(sender);

    // Single consumer; per-source order is preserved because each producer is
    // inherently ordered, sources interleave by arrival.
    loop {
        match receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(line) => write_line(out, &line)?,
            Err(RecvTimeoutError::Timeout) => {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    // Unblock producers stuck in a full-channel send before joining them.
    drop(receiver);
    for reader in readers {
        let _ = reader.join();
    }
    Ok(())
}

/// Follows one file, surviving rotation and replacement: on EOF the path is
/// restatted, and an inode change causes a reopen from the beginning. A
/// temporarily absent file is retried every 500ms.
fn follow_file(
    component: &str,
    path: &Path,
    tail: usize,
    sender: SyncSender<LogLine>,
    stop: &AtomicBool,
) {
    let mut previous = DateTime::<Utc>::MIN_UTC;

    // Emit the initial tail before following from EOF.
    if let Ok(lines) = tail_file(component, path, tail) {
        for line in lines {
            previous = line.timestamp;
            if sender.send(line).is_err() {
                return;
            }
        }
    }

    let mut handle: Option<(BufReader<File>, u64)> = open_at_end(path);

    while !stop.load(Ordering::Relaxed) {
        let Some((reader, inode)) = handle.as_mut() else {
            thread::sleep(constants::FOLLOW_RETRY_INTERVAL);
            handle = open_at_start(path);
            continue;
        };

        let mut buf = String::new();
        match reader.read_line(&mut buf) {
            Ok(0) => {
                match fs::metadata(path) {
                    Ok(meta) if file_inode(&meta) != *inode => {
                        // Rotated or replaced; pick up the new file from the top.
                        debug!("log file {} rotated, reopening", path.display());
                        handle = open_at_start(path);
                    }
                    Ok(_) => thread::sleep(constants::FOLLOW_RETRY_INTERVAL),
                    Err(_) => {
                        handle = None;
                    }
                }
            }
            Ok(_) => {
                let text = buf.trim_end_matches(['\n', '\r']).to_string();
                let timestamp = parse_line_timestamp(&text).unwrap_or(previous);
                previous = timestamp;
                let line = LogLine {
                    timestamp,
                    component: component.to_string(),
                    text,
                };
                if sender.send(line).is_err() {
                    return;
                }
            }
            Err(err) => {
                warn!("error reading {}: {}", path.display(), err);
                handle = None;
            }
        }
    }
}

fn open_at_end(path: &Path) -> Option<(BufReader<File>, u64)> {
    let file = File::open(path).ok()?;
    let inode = file_inode(&file.metadata().ok()?);
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::End(0)).ok()?;
    Some((reader, inode))
}

fn open_at_start(path: &Path) -> Option<(BufReader<File>, u64)> {
    let file = File::open(path).ok()?;
    let inode = file_inode(&file.metadata().ok()?);
    Some((BufReader::new(file), inode))
}

#[cfg(unix)]
fn file_inode(meta: &fs::Metadata) -> u64 {
    meta.ino()
}

#[cfg(not(unix))]
fn file_inode(_meta: &fs::Metadata) -> u64 {
    0
}

/// Follows container logs, reattaching when the container is recreated with
/// a new id (e.g. after `server restart`).
fn follow_container(
    component: &str,
    name: &str,
    tail: usize,
    sender: SyncSender<LogLine>,
    stop: &AtomicBool,
) {
    let mut attached_id: Option<String> = None;
    let mut initial_tail = tail;

    while !stop.load(Ordering::Relaxed) {
        let current = container::resolve_by_name(name);
        let Some(id) = current else {
            thread::sleep(constants::FOLLOW_RETRY_INTERVAL);
            continue;
        };
        if attached_id.as_deref() == Some(id.as_str()) {
            // The stream for this id already terminated; wait for a new
            // container before reattaching.
            thread::sleep(constants::FOLLOW_RETRY_INTERVAL);
            attached_id = None;
            continue;
        }

        let mut child = match container::logs_command(&id, true, initial_tail)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                warn!("cannot follow container {name}: {err}");
                thread::sleep(constants::FOLLOW_RETRY_INTERVAL);
                continue;
            }
        };
        attached_id = Some(id.clone());
        initial_tail = 0;
        debug!("following container {name} ({id})");

        pump_container_stream(component, &mut child, &sender, stop);
        let _ = child.kill();
        let _ = child.wait();
    }
}

fn pump_container_stream(
    component: &str,
    child: &mut Child,
    sender: &SyncSender<LogLine>,
    stop: &AtomicBool,
) {
    let Some(stdout) = child.stdout.take() else {
        return;
    };
    let mut previous = DateTime::<Utc>::MIN_UTC;
    let reader = BufReader::new(stdout);
    for line in reader.lines() {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        let Ok(text) = line else {
            return;
        };
        let timestamp = parse_line_timestamp(&text).unwrap_or(previous);
        previous = timestamp;
        let parsed = LogLine {
            timestamp,
            component: component.to_string(),
            text,
        };
        if sender.send(parsed).is_err() {
            return;
        }
    }
}
