//! Reads the client's merged output, mirrors it to the run log and classifies
//! each line.

use std::path::Path;

use botrun_process::FatalError;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{ChildStderr, ChildStdout},
    sync::mpsc,
    task::JoinHandle,
};

const CLIENT_OUT_OF_DATE: &str = "client is out of date";
const MISSING_WALK_DATA: &str = "update web walking";
const INVALID_CREDENTIALS: &str = "invalid username or password";
const CLIENT_LOADED: &str = "successfully loaded osbot";
const BOT_EXITED: &str = "bot exited";
const SCRIPT_EXITED_SUFFIX: &str = "has exited!";

#[cfg(windows)]
const LINE_ENDING: &[u8] = b"\r\n";
#[cfg(not(windows))]
const LINE_ENDING: &[u8] = b"\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEvent {
    Fatal(FatalError),
    /// The client finished loading; its pid can now be resolved.
    Loaded,
    /// The bot or its script stopped.
    Exited,
    Output,
}

pub fn classify(line: &str) -> LineEvent {
    let line = line.trim().to_lowercase();
    if line.contains(CLIENT_OUT_OF_DATE) {
        LineEvent::Fatal(FatalError::ClientOutOfDate)
    } else if line.contains(MISSING_WALK_DATA) {
        LineEvent::Fatal(FatalError::MissingWalkData)
    } else if line.contains(INVALID_CREDENTIALS) {
        LineEvent::Fatal(FatalError::InvalidCredentials)
    } else if line.contains(CLIENT_LOADED) {
        LineEvent::Loaded
    } else if line.contains(BOT_EXITED)
        || (line.contains("script") && line.ends_with(SCRIPT_EXITED_SUFFIX))
    {
        LineEvent::Exited
    } else {
        LineEvent::Output
    }
}

/// Per-configuration log of raw client output.
pub struct RunLog {
    file: tokio::fs::File,
}

impl RunLog {
    /// Creates the log, discarding whatever a previous run left in it.
    pub fn create(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path)?;
        Ok(Self {
            file: tokio::fs::File::from_std(file),
        })
    }

    pub async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.file.write_all(line.as_bytes()).await?;
        self.file.write_all(LINE_ENDING).await?;
        self.file.flush().await
    }
}

/// Merged output of one client. Dropping it stops the pipe readers.
pub struct ClientOutput {
    pub lines: mpsc::UnboundedReceiver<std::io::Result<String>>,
    readers: Vec<JoinHandle<()>>,
}

impl Drop for ClientOutput {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

/// Merges stdout and stderr into one line stream in arrival order.
///
/// `lines` yields `None` once both streams are closed.
pub fn merge_output(stdout: Option<ChildStdout>, stderr: Option<ChildStderr>) -> ClientOutput {
    let (tx, lines) = mpsc::unbounded_channel();
    let mut readers = Vec::new();
    if let Some(out) = stdout {
        readers.push(forward_lines(out, tx.clone()));
    }
    if let Some(err) = stderr {
        readers.push(forward_lines(err, tx));
    }
    ClientOutput { lines, readers }
}

/// Undecodable bytes become U+FFFD; the line terminator is dropped.
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

fn forward_lines<R>(stream: R, tx: mpsc::UnboundedSender<std::io::Result<String>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send(Ok(decode_line(&buf))).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e));
                    break;
                }
            }
        }
    })
}

/// How reading a command's output ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Both streams closed.
    Ended,
    /// An exit marker was seen and the configuration closes the client on exit.
    ExitMarker,
    Fatal(FatalError),
}

/// Consumes output until it ends, a fatal line appears or, with
/// `close_client`, an exit marker appears. `on_loaded` runs for every load
/// marker.
pub async fn watch_output(
    lines: &mut mpsc::UnboundedReceiver<std::io::Result<String>>,
    log: &mut RunLog,
    close_client: bool,
    mut on_loaded: impl FnMut(),
) -> Outcome {
    while let Some(next) = lines.recv().await {
        let line = match next {
            Ok(line) => line,
            // Only that stream has ended; the other may still be open.
            Err(e) => {
                tracing::warn!(error = %e, "failed reading client output");
                continue;
            }
        };

        if let Err(e) = log.write_line(&line).await {
            tracing::warn!(error = %e, "failed writing run log");
        }
        tracing::trace!(line = %line.trim(), "client output");

        match classify(&line) {
            LineEvent::Fatal(err) => return Outcome::Fatal(err),
            LineEvent::Loaded => on_loaded(),
            LineEvent::Exited if close_client => return Outcome::ExitMarker,
            LineEvent::Exited | LineEvent::Output => {}
        }
    }
    Outcome::Ended
}
