//! Plain-text rendering of the session.

use std::io::{self, Write};

use coordination::notify::Notification;
use coordination::session::SessionController;

/// Transcript lines shown per frame.
const TRANSCRIPT_TAIL: usize = 20;

/// Writes a frame whenever the session's rendered state changes.
pub struct Screen<W: Write> {
    out: W,
    last: Vec<String>,
}

impl<W: Write> Screen<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            last: Vec::new(),
        }
    }

    /// Redraw if anything changed since the last frame.
    pub fn refresh(&mut self, controller: &SessionController) -> io::Result<bool> {
        let lines = frame(controller);
        if lines == self.last {
            return Ok(false);
        }
        writeln!(self.out)?;
        for line in &lines {
            writeln!(self.out, "{line}")?;
        }
        self.out.flush()?;
        self.last = lines;
        Ok(true)
    }

    pub fn notify(&mut self, notification: &Notification) -> io::Result<()> {
        writeln!(
            self.out,
            "[{}] {}",
            notification.severity, notification.message
        )?;
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Header line followed by each sink's output.
pub fn frame(controller: &SessionController) -> Vec<String> {
    let mut lines = vec![header(controller)];
    for (name, mut sink_lines) in controller.snapshot() {
        if sink_lines.is_empty() {
            continue;
        }
        if name == "transcript" && sink_lines.len() > TRANSCRIPT_TAIL {
            sink_lines.drain(..sink_lines.len() - TRANSCRIPT_TAIL);
        }
        lines.push(format!("── {name} ──"));
        lines.extend(sink_lines);
    }
    lines
}

fn header(controller: &SessionController) -> String {
    let label = match controller.label() {
        "" => "no agent",
        label => label,
    };
    let toggle = if controller.can_return() {
        "/back to return"
    } else {
        "/coder to escalate"
    };
    format!("{label} │ {} │ {toggle}", controller.mode())
}
