//! Periodic terminal table of the oldest still-running commands.
//!
//! A smart terminal gets, below the one-line build status, a table of
//! the `max_commands` longest-running commands with their elapsed
//! times. Updates are rate-limited so a fast build does not turn the
//! table into flicker.

use std::collections::{BinaryHeap, HashMap};
use std::io::{self, Write};

/// Terminal operations the table is rendered through.
///
/// Split out as a trait so tests can record the exact call sequence;
/// [`AnsiTablePrinter`] is the real implementation.
pub trait TablePrinter {
    /// Move to the next line and print `line`, erasing its remainder.
    fn print_on_next_line(&mut self, line: &str);
    /// Move to the next line and erase it entirely.
    fn clear_next_line(&mut self);
    /// Move the cursor up `lines` lines.
    fn move_up(&mut self, lines: usize);
    /// Reprint the current line from its start.
    fn print_on_current_line(&mut self, line: &str);
    /// Flush the underlying stream.
    fn flush(&mut self);
}

/// [`TablePrinter`] that emits ANSI escape sequences.
#[derive(Debug)]
pub struct AnsiTablePrinter<W> {
    out: W,
}

impl<W: Write> AnsiTablePrinter<W> {
    /// Wraps a terminal stream. Write errors are ignored: a broken
    /// status display must not fail the build.
    pub fn new(out: W) -> AnsiTablePrinter<W> {
        AnsiTablePrinter { out }
    }
}

impl<W: Write> TablePrinter for AnsiTablePrinter<W> {
    fn print_on_next_line(&mut self, line: &str) {
        let _ = write!(self.out, "\n{}\x1B[0K", line);
    }

    fn clear_next_line(&mut self) {
        let _ = write!(self.out, "\x1B[1B\x1B[2K");
    }

    fn move_up(&mut self, lines: usize) {
        let _ = write!(self.out, "\x1B[{}A", lines);
    }

    fn print_on_current_line(&mut self, line: &str) {
        let _ = write!(self.out, "\r{}\x1B[0K", line);
    }

    fn flush(&mut self) {
        let _ = io::Write::flush(&mut self.out);
    }
}

#[derive(Debug)]
struct PendingCommand {
    start_ms: u64,
    insert_id: u64,
    description: String,
}

/// Tracker and renderer for the oldest in-flight commands.
///
/// Commands are keyed by a caller-chosen identity (typically the
/// subprocess id). Every command is inserted exactly once and removed
/// exactly once; insertion order breaks ties between commands that
/// started in the same millisecond, so the display is stable across
/// updates.
#[derive(Debug)]
pub struct StatusTable<P> {
    printer: P,
    max_commands: usize,
    refresh_timeout_ms: u64,
    pending: HashMap<u64, PendingCommand>,
    next_insert_id: u64,
    last_update_ms: Option<u64>,
    printed_lines: usize,
    last_status: String,
}

impl<P: TablePrinter> StatusTable<P> {
    /// Creates a table showing up to `max_commands` rows (0 disables
    /// the table entirely), refreshing at most once every
    /// `refresh_timeout_ms`.
    pub fn new(printer: P, max_commands: usize, refresh_timeout_ms: u64) -> StatusTable<P> {
        StatusTable {
            printer,
            max_commands,
            refresh_timeout_ms,
            pending: HashMap::new(),
            next_insert_id: 0,
            last_update_ms: None,
            printed_lines: 0,
            last_status: String::new(),
        }
    }

    /// Records that `key` started running at `start_ms`.
    pub fn command_started(&mut self, key: u64, start_ms: u64, description: &str) {
        if self.max_commands == 0 {
            return;
        }
        let insert_id = self.next_insert_id;
        self.next_insert_id += 1;
        let prev = self.pending.insert(
            key,
            PendingCommand {
                start_ms,
                insert_id,
                description: description.to_string(),
            },
        );
        debug_assert!(prev.is_none(), "command {} started twice", key);
    }

    /// Records that `key` finished.
    pub fn command_ended(&mut self, key: u64) {
        if self.max_commands == 0 {
            return;
        }
        let removed = self.pending.remove(&key);
        debug_assert!(removed.is_some(), "command {} ended twice", key);
    }

    /// Sets the status line repainted after each table update.
    pub fn set_status(&mut self, status: &str) {
        self.last_status.clear();
        self.last_status.push_str(status);
    }

    /// Redraws the table if the refresh timeout has elapsed.
    pub fn update(&mut self, now_ms: u64) {
        if self.max_commands == 0 {
            return;
        }
        if let Some(last) = self.last_update_ms {
            if now_ms.saturating_sub(last) < self.refresh_timeout_ms {
                return;
            }
        }
        self.last_update_ms = Some(now_ms);

        // Bounded max-heap over (start, insertion id): the heap holds
        // the K smallest keys seen so far, i.e. the K oldest commands.
        let mut heap: BinaryHeap<(u64, u64, u64)> = BinaryHeap::with_capacity(self.max_commands);
        for (key, cmd) in &self.pending {
            let entry = (cmd.start_ms, cmd.insert_id, *key);
            if heap.len() < self.max_commands {
                heap.push(entry);
            } else if let Some(top) = heap.peek() {
                if *top > entry {
                    heap.pop();
                    heap.push(entry);
                }
            }
        }
        let mut selected = heap.into_sorted_vec();

        let shown = selected.len();
        for (start_ms, _, key) in selected.drain(..) {
            let desc = &self.pending[&key].description;
            self.printer
                .print_on_next_line(&format!("{:>6} | {}", elapsed(now_ms, start_ms), desc));
        }

        let mut below = shown;
        while below < self.printed_lines {
            self.printer.clear_next_line();
            below += 1;
        }
        if below > 0 {
            self.printer.move_up(below);
        }
        self.printer.print_on_current_line(&self.last_status);
        self.printer.flush();

        self.printed_lines = shown;
    }

    /// Erases every printed table line without repainting the status.
    pub fn clear_table(&mut self) {
        if self.printed_lines == 0 {
            return;
        }
        for _ in 0..self.printed_lines {
            self.printer.clear_next_line();
        }
        self.printer.move_up(self.printed_lines);
        self.printer.flush();
        self.printed_lines = 0;
    }

    /// The wrapped printer, for inspection.
    pub fn printer(&self) -> &P {
        &self.printer
    }
}

/// Elapsed time as `S.Ts` below a minute, `MmSs` from there on, or
/// `??????` when the clock ran backwards.
fn elapsed(now_ms: u64, start_ms: u64) -> String {
    if now_ms < start_ms {
        return "??????".to_string();
    }
    let ms = now_ms - start_ms;
    let secs = ms / 1000;
    if secs < 60 {
        format!("{}.{}s", secs, (ms % 1000) / 100)
    } else {
        format!("{}m{}s", secs / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::elapsed;

    #[test]
    fn elapsed_rendering() {
        assert_eq!(elapsed(570, 0), "0.5s");
        assert_eq!(elapsed(570, 250), "0.3s");
        assert_eq!(elapsed(59_999, 0), "59.9s");
        assert_eq!(elapsed(60_000, 0), "1m0s");
        assert_eq!(elapsed(61_500, 0), "1m1s");
        assert_eq!(elapsed(0, 570), "??????");
    }
}
