use crate::config::{LogOptions, LogPaths};
use crate::error::OverseerError;
use crate::logs::TimestampFormat;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::fs::{File as TokioFile, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lines held per destination while it is not writable
pub const MAX_PENDING_LINES: usize = 10_000;

/// Longest line handed to the writer in one piece
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Capacity of the channel between the pipe readers and the writer
const LINE_CHANNEL_CAPACITY: usize = 1024;

/// Which pipe a line was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Non-fatal write failure reported to the supervisor
#[derive(Debug, Clone)]
pub struct LogWarning {
    pub process: String,
    pub instance: usize,
    pub destination: PathBuf,
    pub error: String,
}

/// Counters returned once both pipes of an instance are closed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogRouterStats {
    /// Lines read from stdout and stderr
    pub lines: usize,
    /// Entries written across all destinations
    pub written: usize,
    /// Entries still waiting for a destination to become writable
    pub buffered: usize,
    /// Entries discarded because a buffer was full
    pub dropped: usize,
    pub warnings: usize,
}

/// One append-only log file with its retry buffer
struct Destination {
    path: PathBuf,
    file: Option<TokioFile>,
    pending: VecDeque<Vec<u8>>,
    failing: bool,
    written: usize,
    dropped: usize,
}

impl Destination {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: None,
            pending: VecDeque::new(),
            failing: false,
            written: 0,
            dropped: 0,
        }
    }

    async fn open(path: &Path) -> std::io::Result<TokioFile> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        OpenOptions::new().create(true).append(true).open(path).await
    }

    fn enqueue(&mut self, entry: Vec<u8>) {
        if self.pending.len() >= MAX_PENDING_LINES {
            self.pending.pop_front();
            self.dropped += 1;
        }
        self.pending.push_back(entry);
    }

    /// Write every pending entry in order, stopping at the first failure
    async fn drain(&mut self) -> std::io::Result<()> {
        if self.file.is_none() {
            self.file = Some(Self::open(&self.path).await?);
        }
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };

        while let Some(entry) = self.pending.front() {
            file.write_all(entry).await?;
            file.flush().await?;
            self.pending.pop_front();
            self.written += 1;
        }
        Ok(())
    }
}

/// Routes one instance's stdout and stderr into its out, error and combined files.
///
/// A single router owns all three files, so each file has exactly one writer and
/// the combined file keeps the order in which lines arrived.
pub struct LogRouter {
    process: String,
    instance: usize,
    timestamp: Option<TimestampFormat>,
    out: Destination,
    err: Destination,
    combined: Option<Destination>,
    warnings: Option<mpsc::UnboundedSender<LogWarning>>,
    lines: usize,
    warning_count: usize,
}

impl LogRouter {
    pub fn new(process: &str, instance: usize, paths: &LogPaths, options: &LogOptions) -> Self {
        Self {
            process: process.to_string(),
            instance,
            timestamp: options
                .timestamp
                .then(|| TimestampFormat::parse(&options.date_format)),
            out: Destination::new(paths.out.clone()),
            err: Destination::new(paths.err.clone()),
            combined: paths.combined.clone().map(Destination::new),
            warnings: None,
            lines: 0,
            warning_count: 0,
        }
    }

    /// Report write failures on `sink` in addition to the tracing warning
    pub fn with_warnings(mut self, sink: mpsc::UnboundedSender<LogWarning>) -> Self {
        self.warnings = Some(sink);
        self
    }

    /// Format and write one line to its stream's file and the combined file
    pub async fn write_line(&mut self, stream: StreamKind, line: &[u8]) {
        self.lines += 1;
        let entry = self.format_entry(line);

        let (primary, combined) = match stream {
            StreamKind::Stdout => (&mut self.out, self.combined.as_mut()),
            StreamKind::Stderr => (&mut self.err, self.combined.as_mut()),
        };

        let mut failures = Vec::new();
        if let Some(combined) = combined {
            combined.enqueue(entry.clone());
            if let Some(failure) = Self::drain_destination(combined).await {
                failures.push(failure);
            }
        }
        primary.enqueue(entry);
        if let Some(failure) = Self::drain_destination(primary).await {
            failures.push(failure);
        }

        for (destination, error) in failures {
            self.report(destination, error);
        }
    }

    /// Retry pending entries; returns the failure to report, if this starts a failing episode
    async fn drain_destination(destination: &mut Destination) -> Option<(PathBuf, String)> {
        match destination.drain().await {
            Ok(()) => {
                if destination.failing {
                    info!("Log destination {} is writable again", destination.path.display());
                    destination.failing = false;
                }
                None
            }
            Err(e) => {
                // A fresh handle is opened on the next attempt
                destination.file = None;
                if destination.failing {
                    None
                } else {
                    destination.failing = true;
                    Some((destination.path.clone(), e.to_string()))
                }
            }
        }
    }

    fn report(&mut self, destination: PathBuf, error: String) {
        self.warning_count += 1;
        let failure = OverseerError::LogWrite(destination.display().to_string(), error.clone());
        warn!("{} ({}[{}]); buffering", failure, self.process, self.instance);
        if let Some(sink) = &self.warnings {
            let _ = sink.send(LogWarning {
                process: self.process.clone(),
                instance: self.instance,
                destination,
                error,
            });
        }
    }

    /// Format a log entry: optional `<timestamp>: ` prefix, exactly one trailing newline
    fn format_entry(&self, line: &[u8]) -> Vec<u8> {
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        let line = line.strip_suffix(b"\r").unwrap_or(line);

        let mut entry = Vec::with_capacity(line.len() + 40);
        if let Some(format) = &self.timestamp {
            entry.extend_from_slice(format.now().as_bytes());
            entry.extend_from_slice(b": ");
        }
        entry.extend_from_slice(line);
        entry.push(b'\n');
        entry
    }

    /// Last attempt at pending entries, then the final counters
    pub async fn finish(mut self) -> LogRouterStats {
        let mut failures = Vec::new();
        for destination in self.destinations_mut() {
            if !destination.pending.is_empty() {
                if let Some(failure) = Self::drain_destination(destination).await {
                    failures.push(failure);
                }
            }
        }
        for (destination, error) in failures {
            self.report(destination, error);
        }

        let mut stats = LogRouterStats {
            lines: self.lines,
            warnings: self.warning_count,
            ..Default::default()
        };
        for destination in self.destinations_mut() {
            stats.written += destination.written;
            stats.buffered += destination.pending.len();
            stats.dropped += destination.dropped;
        }
        stats
    }

    fn destinations_mut(&mut self) -> Vec<&mut Destination> {
        let mut all = vec![&mut self.out, &mut self.err];
        if let Some(combined) = self.combined.as_mut() {
            all.push(combined);
        }
        all
    }

    /// Start pumping both pipes into the log files.
    ///
    /// The returned handle resolves once both pipes reached EOF and every line
    /// was handed to its files.
    pub fn attach<O, E>(self, stdout: O, stderr: E) -> JoinHandle<LogRouterStats>
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<(StreamKind, Vec<u8>)>(LINE_CHANNEL_CAPACITY);

        tokio::spawn(read_pipe(stdout, StreamKind::Stdout, tx.clone()));
        tokio::spawn(read_pipe(stderr, StreamKind::Stderr, tx));

        let mut router = self;
        tokio::spawn(async move {
            while let Some((stream, line)) = rx.recv().await {
                router.write_line(stream, &line).await;
            }
            debug!(
                "Log pipes closed for process {} instance {}",
                router.process, router.instance
            );
            router.finish().await
        })
    }
}

/// Read newline-delimited output until EOF; a trailing partial line is sent as-is.
///
/// A line longer than `MAX_LINE_BYTES` is split, the rest following as further lines.
async fn read_pipe<R>(pipe: R, stream: StreamKind, tx: mpsc::Sender<(StreamKind, Vec<u8>)>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut line = Vec::new();

    loop {
        let available = match reader.fill_buf().await {
            Ok(available) => available,
            Err(e) => {
                debug!("Stopped reading {:?} pipe: {}", stream, e);
                break;
            }
        };
        if available.is_empty() {
            if !line.is_empty() {
                let _ = tx.send((stream, line)).await;
            }
            break;
        }

        let room = MAX_LINE_BYTES - line.len();
        let window = &available[..available.len().min(room)];
        let (taken, complete) = match window.iter().position(|&b| b == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (window.len(), window.len() == room),
        };
        line.extend_from_slice(&window[..taken]);
        reader.consume(taken);

        if complete && tx.send((stream, std::mem::take(&mut line))).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn paths_in(dir: &Path, merge: bool) -> LogPaths {
        LogPaths {
            out: dir.join("app-out.log"),
            err: dir.join("app-error.log"),
            combined: merge.then(|| dir.join("app-combined.log")),
        }
    }

    fn plain() -> LogOptions {
        LogOptions {
            timestamp: false,
            date_format: "YYYY".to_string(),
        }
    }

    #[tokio::test]
    async fn test_routes_streams_to_their_files() {
        let temp_dir = TempDir::new().unwrap();
        let paths = paths_in(temp_dir.path(), true);
        let mut router = LogRouter::new("app", 0, &paths, &plain());

        router.write_line(StreamKind::Stdout, b"hello\n").await;
        router.write_line(StreamKind::Stderr, b"oops\n").await;
        router.write_line(StreamKind::Stdout, b"bye").await;
        let stats = router.finish().await;

        let out = std::fs::read_to_string(&paths.out).unwrap();
        let err = std::fs::read_to_string(&paths.err).unwrap();
        let combined = std::fs::read_to_string(paths.combined.as_ref().unwrap()).unwrap();

        assert_eq!(out, "hello\nbye\n");
        assert_eq!(err, "oops\n");
        assert_eq!(combined, "hello\noops\nbye\n");
        assert_eq!(stats.lines, 3);
        assert_eq!(stats.written, 6);
        assert_eq!(stats.buffered, 0);
    }

    #[tokio::test]
    async fn test_timestamp_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let paths = paths_in(temp_dir.path(), false);
        let options = LogOptions {
            timestamp: true,
            date_format: "[ts] YYYY".to_string(),
        };
        let mut router = LogRouter::new("app", 0, &paths, &options);

        router.write_line(StreamKind::Stdout, b"ready\r\n").await;
        router.finish().await;

        let out = std::fs::read_to_string(&paths.out).unwrap();
        let line = out.lines().next().unwrap();
        assert!(line.starts_with("ts "));
        assert!(line.ends_with(": ready"));
        assert!(!paths_in(temp_dir.path(), true)
            .combined
            .unwrap()
            .exists());
    }

    #[tokio::test]
    async fn test_appends_to_existing_file() {
        let temp_dir = TempDir::new().unwrap();
        let paths = paths_in(temp_dir.path(), false);
        std::fs::write(&paths.out, "previous run\n").unwrap();

        let mut router = LogRouter::new("app", 0, &paths, &plain());
        router.write_line(StreamKind::Stdout, b"next run\n").await;
        router.finish().await;

        let out = std::fs::read_to_string(&paths.out).unwrap();
        assert_eq!(out, "previous run\nnext run\n");
    }

    #[tokio::test]
    async fn test_creates_missing_directories() {
        let temp_dir = TempDir::new().unwrap();
        let paths = paths_in(&temp_dir.path().join("nested/logs"), false);

        let mut router = LogRouter::new("app", 0, &paths, &plain());
        router.write_line(StreamKind::Stderr, b"boom\n").await;
        router.finish().await;

        assert!(paths.err.exists());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_write_failure_buffers_and_warns_once() {
        let temp_dir = TempDir::new().unwrap();
        let paths = LogPaths {
            out: PathBuf::from("/dev/full"),
            err: temp_dir.path().join("app-error.log"),
            combined: None,
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut router = LogRouter::new("app", 0, &paths, &plain()).with_warnings(tx);

        router.write_line(StreamKind::Stdout, b"one\n").await;
        router.write_line(StreamKind::Stdout, b"two\n").await;
        router.write_line(StreamKind::Stderr, b"still fine\n").await;
        let stats = router.finish().await;

        let warning = rx.recv().await.unwrap();
        assert_eq!(warning.process, "app");
        assert_eq!(warning.destination, PathBuf::from("/dev/full"));
        assert!(rx.try_recv().is_err());

        assert_eq!(stats.warnings, 1);
        assert_eq!(stats.buffered, 2);
        assert_eq!(
            std::fs::read_to_string(&paths.err).unwrap(),
            "still fine\n"
        );
    }

    #[tokio::test]
    async fn test_attach_preserves_line_order() {
        let temp_dir = TempDir::new().unwrap();
        let paths = paths_in(temp_dir.path(), true);
        let router = LogRouter::new("app", 0, &paths, &plain());

        let stdout: &'static [u8] = b"1\n2\n3\n4\n5";
        let stderr: &'static [u8] = b"";
        let stats = router.attach(stdout, stderr).await.unwrap();

        assert_eq!(stats.lines, 5);
        let out = std::fs::read_to_string(&paths.out).unwrap();
        assert_eq!(out, "1\n2\n3\n4\n5\n");
        let combined = std::fs::read_to_string(paths.combined.as_ref().unwrap()).unwrap();
        assert_eq!(combined, out);
    }

    #[tokio::test]
    async fn test_splits_overlong_lines() {
        let temp_dir = TempDir::new().unwrap();
        let paths = paths_in(temp_dir.path(), false);
        let router = LogRouter::new("app", 0, &paths, &plain());

        let mut output = vec![b'x'; 2 * MAX_LINE_BYTES + 100];
        output.extend_from_slice(b"\nend\n");
        let stdout: &'static [u8] = output.leak();
        let stderr: &'static [u8] = b"";
        let stats = router.attach(stdout, stderr).await.unwrap();

        assert_eq!(stats.lines, 4);
        let out = std::fs::read_to_string(&paths.out).unwrap();
        let lengths: Vec<usize> = out.lines().map(str::len).collect();
        assert_eq!(lengths, vec![MAX_LINE_BYTES, MAX_LINE_BYTES, 100, 3]);
    }
}
