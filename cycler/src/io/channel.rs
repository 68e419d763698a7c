//! Per-cycle local message channel over a Unix domain socket.
//!
//! The supervisor owns a [`MessageChannel`] bound to a path unique to
//! `(plan, cycle)`. Workers connect, write newline-delimited JSON records and
//! disconnect. The socket file is removed when the channel is dropped, which
//! covers normal teardown, `?` early returns and unwinding. A supervisor that
//! is killed outright leaves the file behind; [`sweep_stale_channels`] clears
//! those on the next start.

use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::core::message::{MAX_RECORD_BYTES, WorkerMessage, parse_message};
use crate::errors::{ChannelUnavailable, MalformedMessage};

/// Upper bound on bytes read from a single connection.
const MAX_CONNECTION_BYTES: u64 = (MAX_RECORD_BYTES as u64) * 16;
const READ_TIMEOUT: Duration = Duration::from_millis(500);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// One record pulled off the channel, in arrival order.
#[derive(Debug, Clone)]
pub struct Received {
    pub received_at: DateTime<Utc>,
    pub message: Result<WorkerMessage, MalformedMessage>,
}

/// Supervisor end of a cycle's channel.
#[derive(Debug)]
pub struct MessageChannel {
    path: PathBuf,
    listener: UnixListener,
}

impl MessageChannel {
    /// Bind the endpoint at `path`, replacing any stale socket file.
    pub fn bind(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create channel dir {}", parent.display()))?;
        }
        if path.exists() {
            fs::remove_file(path)
                .with_context(|| format!("remove stale channel {}", path.display()))?;
        }
        let listener = UnixListener::bind(path)
            .with_context(|| format!("bind channel {}", path.display()))?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("restrict channel {}", path.display()))?;
        listener
            .set_nonblocking(true)
            .context("set channel non-blocking")?;
        debug!(path = %path.display(), "channel bound");
        Ok(Self {
            path: path.to_path_buf(),
            listener,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept every pending connection and return its records in order.
    ///
    /// Never blocks waiting for a new connection. An empty result is the
    /// normal "no worker has said anything" case.
    pub fn drain(&self) -> Vec<Received> {
        let mut received = Vec::new();
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => read_connection(stream, &mut received),
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(path = %self.path.display(), "channel accept failed: {err}");
                    break;
                }
            }
        }
        received
    }
}

impl Drop for MessageChannel {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "channel removed"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.path.display(), "failed to remove channel: {err}"),
        }
    }
}

fn read_connection(stream: UnixStream, received: &mut Vec<Received>) {
    let received_at = Utc::now();
    if let Err(err) = stream
        .set_nonblocking(false)
        .and_then(|()| stream.set_read_timeout(Some(READ_TIMEOUT)))
    {
        warn!("channel connection setup failed: {err}");
        return;
    }

    let mut buf = Vec::new();
    let mut limited = stream.take(MAX_CONNECTION_BYTES);
    if let Err(err) = limited.read_to_end(&mut buf) {
        // A partial trailing record is reported as malformed below.
        debug!("channel read ended early: {err}");
    }

    let complete = buf.last() == Some(&b'\n');
    let mut records: Vec<&[u8]> = buf.split(|byte| *byte == b'\n').collect();
    if complete {
        records.pop();
    }
    let last = records.len().saturating_sub(1);
    for (index, raw) in records.into_iter().enumerate() {
        let message = match std::str::from_utf8(raw) {
            Ok(text) if text.trim().is_empty() => continue,
            Ok(text) if !complete && index == last && buf.len() as u64 >= MAX_CONNECTION_BYTES => {
                Err(MalformedMessage::new("connection exceeded size limit", text))
            }
            Ok(text) => parse_message(text),
            Err(err) => Err(MalformedMessage::new(
                format!("record is not utf-8: {err}"),
                &String::from_utf8_lossy(raw),
            )),
        };
        received.push(Received {
            received_at,
            message,
        });
    }
}

/// Remove socket files left in `dir` by a supervisor that died abruptly.
pub fn sweep_stale_channels(dir: &Path) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("sock") {
            continue;
        }
        fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
        debug!(path = %path.display(), "removed stale channel");
        removed += 1;
    }
    Ok(removed)
}

/// Worker end of a channel.
#[derive(Debug, Clone)]
pub struct ChannelSender {
    path: PathBuf,
}

impl ChannelSender {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn send(&self, message: &WorkerMessage) -> Result<(), ChannelUnavailable> {
        self.send_raw(&message.to_record())
    }

    /// Send one pre-serialized record. The record must not contain newlines.
    pub fn send_raw(&self, record: &str) -> Result<(), ChannelUnavailable> {
        let mut stream = UnixStream::connect(&self.path).map_err(|err| self.unavailable(&err))?;
        stream
            .set_write_timeout(Some(WRITE_TIMEOUT))
            .map_err(|err| self.unavailable(&err))?;
        let mut line = record.replace('\n', " ");
        line.push('\n');
        stream
            .write_all(line.as_bytes())
            .and_then(|()| stream.flush())
            .map_err(|err| self.unavailable(&err))?;
        stream
            .shutdown(std::net::Shutdown::Write)
            .map_err(|err| self.unavailable(&err))?;
        Ok(())
    }

    fn unavailable(&self, err: &std::io::Error) -> ChannelUnavailable {
        ChannelUnavailable {
            path: self.path.clone(),
            reason: err.to_string(),
        }
    }
}
