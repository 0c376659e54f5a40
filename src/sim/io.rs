//! Program output handling.
//!
//! The VM's only output path is the `OUT`/`OUTC` pair, observed by the
//! stepper as [`OutputEvent`]s. This module also includes [`OutputLog`],
//! which folds an event sequence into display lines the way the debugger
//! console renders them.

/// One emission observed from an `OUT` or `OUTC` instruction.
#[derive(Debug, PartialEq, Eq, Clone, Copy, serde::Serialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum OutputEvent {
    /// `OUT reg`: the register's full word, rendered as a decimal number.
    Number(u16),
    /// `OUTC reg`: the register's low byte, rendered as a character.
    Char(u8),
}

/// Folds output events into console lines.
///
/// Numeric outputs become decimal digits followed by a newline. Character
/// outputs accumulate into the current line; a character of value `10`
/// terminates the line.
///
/// # Example
/// ```
/// use micro86::sim::io::{OutputEvent, OutputLog};
///
/// let mut log = OutputLog::new();
/// log.push(OutputEvent::Char(b'h'));
/// log.push(OutputEvent::Char(b'i'));
/// log.push(OutputEvent::Char(10));
/// log.push(OutputEvent::Number(42));
/// assert_eq!(log.lines(), ["hi", "42"]);
/// ```
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OutputLog {
    complete: Vec<String>,
    current: String,
}
impl OutputLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Default::default()
    }

    /// Builds a log from a full event sequence.
    pub fn from_events<'e>(events: impl IntoIterator<Item = &'e OutputEvent>) -> Self {
        let mut log = Self::new();
        for &event in events {
            log.push(event);
        }
        log
    }

    /// Appends one event.
    pub fn push(&mut self, event: OutputEvent) {
        match event {
            OutputEvent::Number(n) => {
                self.current.push_str(&n.to_string());
                self.complete.push(std::mem::take(&mut self.current));
            }
            OutputEvent::Char(10) => {
                self.complete.push(std::mem::take(&mut self.current));
            }
            OutputEvent::Char(c) => {
                self.current.push(char::from(c));
            }
        }
    }

    /// All lines, including the unterminated tail line if non-empty.
    pub fn lines(&self) -> Vec<&str> {
        let mut lines: Vec<&str> = self.complete.iter().map(String::as_str).collect();
        if !self.current.is_empty() {
            lines.push(&self.current);
        }
        lines
    }

    /// The whole log as one string, lines separated by `\n`.
    pub fn text(&self) -> String {
        self.lines().join("\n")
    }
}

/// Extracts just the numeric emissions from an event sequence.
///
/// Convenient for checking the "expected numeric output" of a program.
pub fn numbers<'e>(events: impl IntoIterator<Item = &'e OutputEvent>) -> Vec<u16> {
    events.into_iter()
        .filter_map(|event| match event {
            OutputEvent::Number(n) => Some(*n),
            OutputEvent::Char(_) => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_make_whole_lines() {
        let mut log = OutputLog::new();
        log.push(OutputEvent::Number(10));
        log.push(OutputEvent::Number(9));
        assert_eq!(log.lines(), ["10", "9"]);
    }

    #[test]
    fn chars_accumulate_until_newline() {
        let mut log = OutputLog::new();
        for c in *b"ok" {
            log.push(OutputEvent::Char(c));
        }
        assert_eq!(log.lines(), ["ok"]);
        log.push(OutputEvent::Char(10));
        log.push(OutputEvent::Char(b'!'));
        assert_eq!(log.lines(), ["ok", "!"]);
        assert_eq!(log.text(), "ok\n!");
    }

    #[test]
    fn mixed_chars_and_numbers() {
        let events = [
            OutputEvent::Char(b'x'),
            OutputEvent::Char(b'='),
            OutputEvent::Number(3),
        ];
        let log = OutputLog::from_events(&events);
        assert_eq!(log.lines(), ["x=3"]);
        assert_eq!(numbers(&events), [3]);
    }
}
