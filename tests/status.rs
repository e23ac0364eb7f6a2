use jobcrew::{StatusTable, TablePrinter};

#[derive(Debug, PartialEq)]
enum Event {
    NextLine(String),
    ClearNextLine,
    MoveUp(usize),
    CurrentLine(String),
    Flush,
}

#[derive(Debug, Default)]
struct Recorder {
    events: Vec<Event>,
}

impl TablePrinter for Recorder {
    fn print_on_next_line(&mut self, line: &str) {
        self.events.push(Event::NextLine(line.to_string()));
    }

    fn clear_next_line(&mut self) {
        self.events.push(Event::ClearNextLine);
    }

    fn move_up(&mut self, lines: usize) {
        self.events.push(Event::MoveUp(lines));
    }

    fn print_on_current_line(&mut self, line: &str) {
        self.events.push(Event::CurrentLine(line.to_string()));
    }

    fn flush(&mut self) {
        self.events.push(Event::Flush);
    }
}

#[test]
fn renders_the_two_oldest_commands() {
    let mut table = StatusTable::new(Recorder::default(), 2, 100);
    table.set_status("some_status");
    table.command_started(1, 0, "command_1");
    table.command_started(2, 250, "command_2");
    table.command_started(3, 570, "command_3");
    table.update(570);

    assert_eq!(
        table.printer().events,
        vec![
            Event::NextLine("  0.5s | command_1".to_string()),
            Event::NextLine("  0.3s | command_2".to_string()),
            Event::MoveUp(2),
            Event::CurrentLine("some_status".to_string()),
            Event::Flush,
        ]
    );
}

#[test]
fn refresh_timeout_suppresses_updates() {
    let mut table = StatusTable::new(Recorder::default(), 1, 100);
    table.command_started(1, 0, "cmd");

    table.update(0);
    let after_first = table.printer().events.len();
    assert!(after_first > 0);

    // Too soon; nothing new may be printed.
    table.update(50);
    assert_eq!(table.printer().events.len(), after_first);

    table.update(100);
    assert!(table.printer().events.len() > after_first);
}

#[test]
fn equal_start_times_keep_insertion_order() {
    let mut table = StatusTable::new(Recorder::default(), 2, 0);
    table.command_started(10, 500, "first");
    table.command_started(11, 500, "second");

    table.update(1500);
    table.update(2500);

    let lines: Vec<&String> = table
        .printer()
        .events
        .iter()
        .filter_map(|e| match e {
            Event::NextLine(line) => Some(line),
            _ => None,
        })
        .collect();
    assert_eq!(lines.len(), 4);
    assert!(lines[0].ends_with("| first"));
    assert!(lines[1].ends_with("| second"));
    assert!(lines[2].ends_with("| first"));
    assert!(lines[3].ends_with("| second"));
}

#[test]
fn stale_lines_are_cleared_before_moving_up() {
    let mut table = StatusTable::new(Recorder::default(), 2, 0);
    table.set_status("building");
    table.command_started(1, 0, "a");
    table.command_started(2, 0, "b");
    table.update(100);

    table.command_ended(2);
    table.update(200);

    assert_eq!(
        table.printer().events[5..],
        [
            Event::NextLine("  0.2s | a".to_string()),
            Event::ClearNextLine,
            Event::MoveUp(2),
            Event::CurrentLine("building".to_string()),
            Event::Flush,
        ]
    );
}

#[test]
fn clear_table_erases_without_reprinting_status() {
    let mut table = StatusTable::new(Recorder::default(), 2, 0);
    table.command_started(1, 0, "a");
    table.command_started(2, 0, "b");
    table.update(100);
    let rendered = table.printer().events.len();

    table.clear_table();
    assert_eq!(
        table.printer().events[rendered..],
        [
            Event::ClearNextLine,
            Event::ClearNextLine,
            Event::MoveUp(2),
            Event::Flush,
        ]
    );

    // Nothing left to erase the second time around.
    let after_clear = table.printer().events.len();
    table.clear_table();
    assert_eq!(table.printer().events.len(), after_clear);
}

#[test]
fn future_start_times_render_as_unknown() {
    let mut table = StatusTable::new(Recorder::default(), 1, 0);
    table.command_started(1, 1000, "from_the_future");
    table.update(500);

    assert_eq!(
        table.printer().events[0],
        Event::NextLine("?????? | from_the_future".to_string())
    );
}

#[test]
fn minute_long_commands_switch_format() {
    let mut table = StatusTable::new(Recorder::default(), 1, 0);
    table.command_started(1, 0, "slow");
    table.update(61_500);

    assert_eq!(
        table.printer().events[0],
        Event::NextLine("  1m1s | slow".to_string())
    );
}

#[test]
fn zero_max_commands_disables_the_table() {
    let mut table = StatusTable::new(Recorder::default(), 0, 0);
    table.command_started(1, 0, "ignored");
    table.update(100);
    table.command_ended(1);
    table.clear_table();
    assert!(table.printer().events.is_empty());
}
