//! Terminal rendering of provisioning progress.

use std::io::{IsTerminal, Write};
use std::sync::Mutex;

use dangerzone_vm::{ProgressEvent, ProgressSink, Stage};

const CLEAR_LINE: &str = "\r\x1b[2K";

/// Writes progress to stderr. On a terminal the live status line of a
/// running command is redrawn in place; otherwise only finished lines are
/// printed.
pub struct TerminalSink {
    interactive: bool,
    out: Mutex<Box<dyn Write + Send>>,
}

impl TerminalSink {
    pub fn stderr() -> Self {
        Self {
            interactive: std::io::stderr().is_terminal(),
            out: Mutex::new(Box::new(std::io::stderr())),
        }
    }

    fn render(&self, event: &ProgressEvent) -> Option<String> {
        let clear = if self.interactive { CLEAR_LINE } else { "" };
        match event {
            ProgressEvent::Stage(stage) => Some(format!("{clear}==> {}\n", stage.title())),
            ProgressEvent::Status { title, detail } if detail.is_empty() => {
                Some(format!("{clear}    {title}\n"))
            }
            ProgressEvent::Status { title, detail } => {
                Some(format!("{clear}    {title}: {detail}\n"))
            }
            ProgressEvent::Output { line, .. } => {
                let (current, complete) = current_line(line);
                if complete {
                    Some(format!("{clear}    {current}\n"))
                } else if self.interactive && !current.is_empty() {
                    Some(format!("{clear}    {current}"))
                } else {
                    None
                }
            }
            ProgressEvent::Download { downloaded, total } => {
                if !self.interactive {
                    return None;
                }
                let progress = match total {
                    Some(total) if *total > 0 => {
                        format!("{} / {}", human_bytes(*downloaded), human_bytes(*total))
                    }
                    _ => human_bytes(*downloaded),
                };
                Some(format!("{clear}    {progress}"))
            }
            ProgressEvent::Finished {
                stage: Stage::Completed,
                ..
            } => Some(format!("{clear}==> {}\n", Stage::Completed.title())),
            // Failures and cancellation are reported by the caller.
            ProgressEvent::Finished { .. } => self.interactive.then(|| CLEAR_LINE.to_string()),
        }
    }
}

impl ProgressSink for TerminalSink {
    fn emit(&self, event: ProgressEvent) {
        let Some(text) = self.render(&event) else {
            return;
        };
        if let Ok(mut out) = self.out.lock() {
            let _ = out.write_all(text.as_bytes());
            let _ = out.flush();
        }
    }
}

/// The segment a terminal would show for `line`, and whether it has been
/// terminated by a newline.
fn current_line(line: &str) -> (&str, bool) {
    let (body, complete) = match line.strip_suffix('\n') {
        Some(body) => (body, true),
        None => (line, false),
    };
    let segment = body.rsplit('\n').next().unwrap_or(body);
    (segment.trim_end(), complete)
}

fn human_bytes(n: u64) -> String {
    const MIB: f64 = 1024.0 * 1024.0;
    if n < 1024 * 1024 {
        format!("{:.0} KiB", n as f64 / 1024.0)
    } else {
        format!("{:.1} MiB", n as f64 / MIB)
    }
}
