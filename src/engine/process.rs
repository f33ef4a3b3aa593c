//! Target process adapter
//!
//! Runs the external executable once per step. The executable receives a
//! single positional argument, `key=value` pairs joined by `;`. Output is
//! drained from both pipes concurrently and decoded with a streaming
//! decoder so multi-byte characters split across reads survive.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use chrono::Utc;
use encoding_rs::{CoderResult, Decoder, Encoding, UTF_8};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::common::{Error, Result};

use super::events::OutputStream;
use super::result::Response;

/// Default per-invocation timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const READ_CHUNK: usize = 8 * 1024;

/// Join ordered arguments into the single positional argument
pub fn serialize_arguments(arguments: &[(String, String)]) -> String {
    arguments
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(";")
}

/// Resolve an output encoding label, falling back to UTF-8
pub fn resolve_encoding(label: &str) -> &'static Encoding {
    let normalized = label.trim().to_ascii_lowercase();
    let label = match normalized.as_str() {
        "cp949" | "ms949" | "uhc" => "windows-949",
        other => other,
    };
    match Encoding::for_label(label.as_bytes()) {
        Some(encoding) => encoding,
        None => {
            tracing::warn!(label, "Unknown output encoding, using UTF-8");
            UTF_8
        }
    }
}

/// Decode one chunk, keeping partial sequences in the decoder
///
/// A legacy decoder that hits malformed input gives way to a lossy UTF-8
/// rendering of the raw bytes.
fn decode_chunk(decoder: &mut Decoder, bytes: &[u8], last: bool) -> String {
    let mut out = String::new();
    let mut input = bytes;
    let mut had_errors = false;

    loop {
        let needed = decoder
            .max_utf8_buffer_length(input.len())
            .unwrap_or(input.len() * 3 + 16);
        out.reserve(needed);
        let (result, read, errors) = decoder.decode_to_string(input, &mut out, last);
        had_errors |= errors;
        input = &input[read..];
        if let CoderResult::InputEmpty = result {
            break;
        }
    }

    if had_errors && decoder.encoding() != UTF_8 {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    out
}

async fn pump<R>(
    mut reader: R,
    stream: OutputStream,
    encoding: &'static Encoding,
    tx: mpsc::UnboundedSender<(OutputStream, String)>,
) where
    R: AsyncRead + Unpin,
{
    let mut decoder = encoding.new_decoder();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let (n, last) = match reader.read(&mut buf).await {
            Ok(0) => (0, true),
            Ok(n) => (n, false),
            Err(e) => {
                tracing::debug!(?stream, error = %e, "Output pipe read failed");
                (0, true)
            }
        };
        let text = decode_chunk(&mut decoder, &buf[..n], last);
        if !text.is_empty() && tx.send((stream, text)).is_err() {
            break;
        }
        if last {
            break;
        }
    }
}

/// Spawns the target executable and collects a [`Response`]
#[derive(Debug, Clone)]
pub struct ProcessAdapter {
    binary: PathBuf,
    timeout: Duration,
    encoding: &'static Encoding,
    env: Vec<(String, String)>,
}

impl ProcessAdapter {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timeout: DEFAULT_TIMEOUT,
            encoding: UTF_8,
            env: Vec::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_encoding(mut self, label: &str) -> Self {
        self.encoding = resolve_encoding(label);
        self
    }

    /// Extra environment for the child
    pub fn with_env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn encoding(&self) -> &'static str {
        self.encoding.name()
    }

    /// Run the executable with `command_line` as its only argument
    ///
    /// `on_output` sees every decoded chunk as it arrives. A non-zero exit
    /// code is returned in the response, not as an error. Timeout and
    /// cancellation kill the child.
    pub async fn execute<F>(
        &self,
        command_line: &str,
        mut on_output: F,
        cancel: &CancellationToken,
    ) -> Result<Response>
    where
        F: FnMut(OutputStream, &str) + Send,
    {
        let started_at = Utc::now();
        let start = Instant::now();

        let mut child = Command::new(&self.binary)
            .arg(command_line)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::spawn_failed(&self.binary, e))?;

        tracing::debug!(
            binary = %self.binary.display(),
            pid = ?child.id(),
            command_line,
            "Spawned target"
        );

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::spawn_failed(&self.binary, "stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::spawn_failed(&self.binary, "stderr not captured"))?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let readers = [
            tokio::spawn(pump(stdout, OutputStream::Stdout, self.encoding, tx.clone())),
            tokio::spawn(pump(stderr, OutputStream::Stderr, self.encoding, tx)),
        ];

        let mut out = String::new();
        let mut err = String::new();
        let mut collect = |stream: OutputStream, text: String| {
            on_output(stream, &text);
            match stream {
                OutputStream::Stdout => out.push_str(&text),
                OutputStream::Stderr => err.push_str(&text),
            }
        };

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let status = loop {
            tokio::select! {
                Some((stream, text)) = rx.recv() => collect(stream, text),
                status = child.wait() => break status?,
                _ = &mut deadline => {
                    let _ = child.kill().await;
                    readers.iter().for_each(|r| r.abort());
                    let ms = self.timeout.as_millis() as u64;
                    tracing::warn!(binary = %self.binary.display(), timeout_ms = ms, "Target timed out, killed");
                    return Err(Error::ProcessTimeout(ms));
                }
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    readers.iter().for_each(|r| r.abort());
                    tracing::info!(binary = %self.binary.display(), "Target killed on cancellation");
                    return Err(Error::Cancelled);
                }
            }
        };

        // Drain what the readers still hold. A grandchild keeping the pipes
        // open must not stall the step past its deadline.
        loop {
            tokio::select! {
                next = rx.recv() => match next {
                    Some((stream, text)) => collect(stream, text),
                    None => break,
                },
                _ = &mut deadline => {
                    readers.iter().for_each(|r| r.abort());
                    break;
                }
            }
        }

        let exit_code = status.code().unwrap_or(-1);
        let duration_ms = start.elapsed().as_millis() as u64;
        tracing::debug!(exit_code, duration_ms, "Target exited");

        Ok(Response {
            exit_code,
            parsed_fields: Response::parse_fields(&out),
            stdout: out,
            stderr: err,
            duration_ms,
            command_line: command_line.to_string(),
            started_at,
        })
    }
}
