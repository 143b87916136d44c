//! Running external commands whose output is a redrawn terminal line rather
//! than newline-delimited logs.
//!
//! `multipass launch` and friends draw spinners and percentages with
//! backspace and carriage-return redraws. Splitting on `\n` would show
//! nothing for minutes, so output is fed through a [`LineBuffer`] byte by
//! byte and the reconstructed line is reported after every byte.

use std::borrow::Cow;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::{ProvisionError, Result};
use crate::progress::CancelFlag;

const BACKSPACE: u8 = 0x08;
const CARRIAGE_RETURN: u8 = 0x0D;
const CANCEL_POLL: Duration = Duration::from_millis(100);
const READ_CHUNK: usize = 1024;

/// Which pipe a status line came from. Each is decoded independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputSource {
    Stdout,
    Stderr,
}

/// Reconstruction of the line a terminal would currently be showing.
#[derive(Debug, Default, Clone)]
pub struct LineBuffer {
    bytes: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, byte: u8) {
        match byte {
            BACKSPACE => self.pop_char(),
            CARRIAGE_RETURN => self.bytes.clear(),
            other => self.bytes.push(other),
        }
    }

    /// Drop the last UTF-8 character, or a single byte when the tail is not
    /// a complete character. No-op on an empty buffer.
    fn pop_char(&mut self) {
        let len = self.bytes.len();
        if len == 0 {
            return;
        }
        let floor = len.saturating_sub(4);
        let mut start = len - 1;
        while start > floor && is_continuation(self.bytes[start]) {
            start -= 1;
        }
        let lead = self.bytes[start];
        if !is_continuation(lead) && utf8_width(lead) == len - start {
            self.bytes.truncate(start);
        } else {
            self.bytes.truncate(len - 1);
        }
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

fn is_continuation(byte: u8) -> bool {
    byte & 0xC0 == 0x80
}

/// Encoded length of the character `lead` starts; 0 for invalid leads.
fn utf8_width(lead: u8) -> usize {
    match lead {
        0x00..=0x7F => 1,
        0xC0..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF7 => 4,
        _ => 0,
    }
}

/// The part of a decoded buffer a terminal would still show: everything after
/// the last newline, keeping a trailing newline that ends the line.
pub fn visible_segment(line: &str) -> &str {
    let body = line.strip_suffix('\n').unwrap_or(line);
    match body.rfind('\n') {
        Some(idx) => &line[idx + 1..],
        None => line,
    }
}

/// Spawn `cmd`, decode stdout and stderr through separate [`LineBuffer`]s
/// and call `on_line` with the current line after every byte.
///
/// Returns the exit code once the process has exited. A process killed by a
/// signal reports `-1`. If `cancel` is raised while the command runs, the
/// child is killed and reaped and [`ProvisionError::Cancelled`] is returned.
pub async fn run_interactive<F>(
    cmd: &mut Command,
    label: &str,
    cancel: &CancelFlag,
    mut on_line: F,
) -> Result<i32>
where
    F: FnMut(OutputSource, &str),
{
    debug!(command = label, "running interactive command");
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ProvisionError::Spawn {
            command: label.to_string(),
            source,
        })?;

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut out_line = LineBuffer::new();
    let mut err_line = LineBuffer::new();
    let mut out_chunk = [0u8; READ_CHUNK];
    let mut err_chunk = [0u8; READ_CHUNK];
    let mut poll = tokio::time::interval(CANCEL_POLL);

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            n = read_some(&mut stdout, &mut out_chunk), if stdout.is_some() => {
                match n {
                    Ok(0) => stdout = None,
                    Ok(n) => {
                        for &byte in &out_chunk[..n] {
                            out_line.push(byte);
                            on_line(OutputSource::Stdout, &out_line.text());
                        }
                    }
                    Err(e) => {
                        warn!(command = label, error = %e, "stdout read failed");
                        stdout = None;
                    }
                }
            }
            n = read_some(&mut stderr, &mut err_chunk), if stderr.is_some() => {
                match n {
                    Ok(0) => stderr = None,
                    Ok(n) => {
                        for &byte in &err_chunk[..n] {
                            err_line.push(byte);
                            on_line(OutputSource::Stderr, &err_line.text());
                        }
                    }
                    Err(e) => {
                        warn!(command = label, error = %e, "stderr read failed");
                        stderr = None;
                    }
                }
            }
            _ = poll.tick() => {
                if cancel.is_cancelled() {
                    return Err(kill(&mut child, label).await);
                }
            }
        }
    }

    let status = wait_or_kill(&mut child, label, cancel).await?;
    let code = status.code().unwrap_or(-1);
    debug!(command = label, code, "interactive command exited");
    Ok(code)
}

/// Resolves once `cancel` has been raised.
pub(crate) async fn cancelled(cancel: &CancelFlag) {
    let mut poll = tokio::time::interval(CANCEL_POLL);
    loop {
        poll.tick().await;
        if cancel.is_cancelled() {
            return;
        }
    }
}

/// Wait for `child` to exit. If `cancel` is raised first the child is killed
/// and reaped and [`ProvisionError::Cancelled`] is returned.
pub(crate) async fn wait_or_kill(
    child: &mut Child,
    label: &str,
    cancel: &CancelFlag,
) -> Result<ExitStatus> {
    tokio::select! {
        status = child.wait() => {
            status.map_err(|e| ProvisionError::io(format!("wait for {label}"), e))
        }
        _ = cancelled(cancel) => Err(kill(child, label).await),
    }
}

async fn read_some<R>(reader: &mut Option<R>, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncReadExt + Unpin,
{
    match reader {
        Some(r) => r.read(buf).await,
        None => Ok(0),
    }
}

async fn kill(child: &mut Child, label: &str) -> ProvisionError {
    warn!(command = label, "cancelled, terminating child process");
    if let Err(e) = child.kill().await {
        warn!(command = label, error = %e, "failed to kill child process");
    }
    ProvisionError::Cancelled
}

/// Remove ANSI escape sequences (colours, cursor movement) from `s`.
pub fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('[') => {
                chars.next();
                // CSI: parameters and intermediates, then one final byte in @..~
                for c in chars.by_ref() {
                    if ('@'..='~').contains(&c) {
                        break;
                    }
                }
            }
            Some(_) => {
                chars.next();
            }
            None => {}
        }
    }
    out
}
