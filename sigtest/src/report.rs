//! Final per-sender summary.
//!
//! Output looks like:
//!
//! ```text
//! -----------------------------------
//! From :a1b2.2 - Total signal count- 120, Last signal #- 120, Missed signals- 0
//! Total signals missed = 0
//! -----------------------------------
//! ```
//!
//! The summary is emitted at most once per [`ReportPrinter`], however many
//! terminal paths race to print it.

use std::fmt::Write as _;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::tracker::{LossTracker, Summary};

const RULE: &str = "-----------------------------------";

/// Render `summary` as text, one line per sender.
pub fn render(summary: &Summary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{RULE}");
    for s in &summary.senders {
        let _ = write!(
            out,
            "From {} - Total signal count- {}, Last signal #- {}, Missed signals- {}",
            s.sender, s.total_received, s.last_seq, s.missed
        );
        if s.out_of_order > 0 {
            let _ = write!(out, ", Out of order- {}", s.out_of_order);
        }
        out.push('\n');
    }
    let _ = writeln!(out, "Total signals missed = {}", summary.total_missed);
    let _ = writeln!(out, "{RULE}");
    out
}

/// Prints the summary exactly once.
pub struct ReportPrinter {
    printed: AtomicBool,
    out: Mutex<Box<dyn Write + Send>>,
}

impl Default for ReportPrinter {
    fn default() -> Self {
        Self::to_writer(io::stdout())
    }
}

impl ReportPrinter {
    /// Printer writing to stdout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Printer writing to `out` instead of stdout.
    pub fn to_writer(out: impl Write + Send + 'static) -> Self {
        Self {
            printed: AtomicBool::new(false),
            out: Mutex::new(Box::new(out)),
        }
    }

    pub fn has_printed(&self) -> bool {
        self.printed.load(Ordering::SeqCst)
    }

    /// Write `summary` to `out` unless a report was already written.
    ///
    /// Returns `Ok(true)` for the call that wrote.
    pub fn report_once<W: Write>(&self, summary: &Summary, out: &mut W) -> io::Result<bool> {
        if self.printed.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        out.write_all(render(summary).as_bytes())?;
        out.flush()?;
        Ok(true)
    }

    /// Print `tracker`'s summary to this printer's output once.
    pub fn print_once(&self, tracker: &LossTracker) -> bool {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        match self.report_once(&tracker.summary(), &mut *out) {
            Ok(printed) => printed,
            Err(e) => {
                log::error!("failed to print summary: {e}");
                true
            }
        }
    }
}
