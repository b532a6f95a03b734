use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use flate2::write::GzEncoder;
use flate2::Compression;

use super::StepError;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long to wait for the pipes of a killed process to close.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Destination of a child process' stdout.
#[derive(Debug, Clone)]
pub enum Stdout {
    /// Keep the tail in the step's captured output.
    Capture,
    /// Keep everything in [ProcessOutput::stdout], for machine readable output.
    Collect,
    /// Stream into a freshly created file, optionally gzipped.
    File { path: PathBuf, compress: bool },
}

/// Keeps the last `limit` bytes pushed into it.
#[derive(Debug, Clone, Default)]
pub struct BoundedBuffer {
    limit: usize,
    data: VecDeque<u8>,
    dropped: usize,
}

impl BoundedBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            data: VecDeque::new(),
            dropped: 0,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        if bytes.len() >= self.limit {
            self.dropped += self.data.len() + bytes.len() - self.limit;
            self.data.clear();
            self.data.extend(&bytes[bytes.len() - self.limit..]);
            return;
        }

        let overflow = (self.data.len() + bytes.len()).saturating_sub(self.limit);
        self.data.drain(..overflow);
        self.dropped += overflow;
        self.data.extend(bytes);
    }

    /// Pushes the content of `other`, keeping track of what it dropped.
    pub fn append(&mut self, other: BoundedBuffer) {
        self.dropped += other.dropped;
        let bytes: Vec<u8> = other.data.into();
        self.push(&bytes);
    }

    /// Number of bytes discarded so far.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn into_string(self) -> String {
        let bytes: Vec<u8> = self.data.into();
        let text = String::from_utf8_lossy(&bytes);
        if self.dropped == 0 {
            text.into_owned()
        } else {
            format!("[... {} bytes truncated ...]\n{text}", self.dropped)
        }
    }
}

/// Result of a finished child process.
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    /// Complete stdout if [Stdout::Collect] was requested.
    pub stdout: String,
    /// Tail of stderr.
    pub stderr: String,
    pub(super) captured: BoundedBuffer,
    /// Set if the process was killed or its output couldn't be handled.
    pub(super) failure: Option<StepError>,
}

enum Stream {
    Stdout(io::Result<(String, BoundedBuffer)>),
    Stderr(io::Result<BoundedBuffer>),
}

/// Runs `cmd`, polling `should_abort` until the process exits.
pub(super) fn run(
    cmd: &mut Command,
    stdout: Stdout,
    max_output: usize,
    should_abort: impl Fn() -> Option<StepError>,
) -> Result<ProcessOutput, StepError> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| StepError::Spawn {
            program: program.clone(),
            error: e.to_string(),
        })?;

    let (tx, rx) = mpsc::channel();
    if let Some(pipe) = child.stdout.take() {
        let tx = tx.clone();
        thread::spawn(move || {
            let _ = tx.send(Stream::Stdout(read_stdout(pipe, stdout, max_output)));
        });
    }
    if let Some(pipe) = child.stderr.take() {
        let tx = tx.clone();
        thread::spawn(move || {
            let _ = tx.send(Stream::Stderr(capture(pipe, max_output)));
        });
    }
    drop(tx);

    let mut failure = None;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e.into());
            }
        }

        if let Some(reason) = should_abort() {
            log::warn!(target: "pipeline::process", "Terminating {program}: {reason}");
            let _ = child.kill();
            let status = child.wait()?;
            failure = Some(reason);
            break status;
        }
        thread::sleep(POLL_INTERVAL);
    };

    let mut grace_until = failure.as_ref().map(|_| Instant::now() + KILL_GRACE);
    let mut collected = String::new();
    let mut captured = BoundedBuffer::new(max_output);
    let mut stderr = BoundedBuffer::new(max_output);
    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(Stream::Stdout(Ok((text, tail)))) => {
                collected = text;
                captured.append(tail);
            }
            Ok(Stream::Stderr(Ok(tail))) => stderr = tail,
            Ok(Stream::Stdout(Err(e)) | Stream::Stderr(Err(e))) => {
                failure.get_or_insert(StepError::Io(format!("{program}: {e}")));
            }
            Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                if grace_until.is_some_and(|until| Instant::now() >= until) {
                    log::warn!(target: "pipeline::process", "Output of {program} is still open, abandoning it");
                    break;
                }
                if grace_until.is_none() {
                    if let Some(reason) = should_abort() {
                        failure = Some(reason);
                        grace_until = Some(Instant::now() + KILL_GRACE);
                    }
                }
            }
        }
    }
    captured.append(stderr.clone());

    Ok(ProcessOutput {
        status,
        stdout: collected,
        stderr: stderr.into_string(),
        captured,
        failure,
    })
}

fn capture(mut reader: impl Read, limit: usize) -> io::Result<BoundedBuffer> {
    let mut buffer = BoundedBuffer::new(limit);
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => return Ok(buffer),
            Ok(n) => buffer.push(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

fn read_stdout(
    mut reader: impl Read,
    stdout: Stdout,
    limit: usize,
) -> io::Result<(String, BoundedBuffer)> {
    match stdout {
        Stdout::Capture => Ok((String::new(), capture(reader, limit)?)),
        Stdout::Collect => {
            let mut bytes = Vec::new();
            reader.read_to_end(&mut bytes)?;
            let text = String::from_utf8_lossy(&bytes).into_owned();
            Ok((text, BoundedBuffer::new(limit)))
        }
        Stdout::File { path, compress } => {
            let file = File::create_new(&path)?;
            let written = if compress {
                let mut encoder = GzEncoder::new(file, Compression::default());
                let written = io::copy(&mut reader, &mut encoder)?;
                encoder.finish()?.sync_all()?;
                written
            } else {
                let mut writer = BufWriter::new(file);
                let written = io::copy(&mut reader, &mut writer)?;
                writer.flush()?;
                writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
                written
            };
            log::trace!(target: "pipeline::process", "Wrote {written} bytes to {}", path.display());
            Ok((String::new(), BoundedBuffer::new(limit)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_buffer_keeps_tail() {
        let mut buffer = BoundedBuffer::new(5);
        buffer.push(b"abc");
        buffer.push(b"defg");
        assert_eq!(buffer.dropped(), 2);
        assert_eq!(buffer.into_string(), "[... 2 bytes truncated ...]\ncdefg");
    }

    #[test]
    fn bounded_buffer_oversized_chunk() {
        let mut buffer = BoundedBuffer::new(3);
        buffer.push(b"ab");
        buffer.push(b"0123456");
        assert_eq!(buffer.dropped(), 6);
        assert_eq!(buffer.into_string(), "[... 6 bytes truncated ...]\n456");
    }

    #[test]
    fn append_accumulates_dropped() {
        let mut inner = BoundedBuffer::new(2);
        inner.push(b"xyz");
        let mut outer = BoundedBuffer::new(4);
        outer.push(b"ab");
        outer.append(inner);
        assert_eq!(outer.into_string(), "[... 1 bytes truncated ...]\nabyz");
    }

    #[test]
    fn stdout_into_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let stdout = Stdout::File {
            path: path.clone(),
            compress: false,
        };

        let output = run(
            Command::new("sh").arg("-c").arg("echo dumped; echo warn >&2"),
            stdout,
            1024,
            || None,
        )
        .unwrap();

        assert!(output.status.success());
        assert_eq!(std::fs::read_to_string(path).unwrap(), "dumped\n");
        assert_eq!(output.stderr, "warn\n");
        assert_eq!(output.captured.into_string(), "warn\n");
    }

    #[test]
    fn collect_keeps_everything() {
        let output = run(
            Command::new("sh").arg("-c").arg("printf '0123456789'"),
            Stdout::Collect,
            4,
            || None,
        )
        .unwrap();

        assert_eq!(output.stdout, "0123456789");
        assert!(output.failure.is_none());
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let err = run(
            &mut Command::new("/nonexistent/definitely-not-here"),
            Stdout::Capture,
            16,
            || None,
        )
        .unwrap_err();

        assert!(matches!(err, StepError::Spawn { .. }));
    }
}
