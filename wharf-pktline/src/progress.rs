//! Scrape human-readable progress lines from side-band channel 2.
//!
//! Remote processes report progress as lines of the form
//! `<task>: <n>/<m>` (bounded) or `<task>: <n>` (unbounded), usually
//! terminated by a carriage return so the terminal overwrites them in
//! place. Lines may be split across packet boundaries, so the parser
//! buffers partial input and only interprets complete lines.

use regex::Regex;

/// A single scraped progress update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// A recognised task counter.
    Counter {
        /// The task name, e.g. `Counting objects`.
        task: String,
        /// The current count.
        current: u64,
        /// The final count, if the task is bounded.
        total: Option<u64>,
        /// `true` when this update begins a new task, resetting the baseline.
        starts_task: bool,
    },
    /// A line that matched neither pattern, passed through verbatim.
    Message(String),
}

/// Incremental parser for remote progress output.
pub struct ProgressParser {
    bounded: Regex,
    unbounded: Regex,
    partial: String,
    current_task: Option<String>,
}

impl Default for ProgressParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressParser {
    /// Create a parser with an empty line buffer.
    pub fn new() -> Self {
        Self {
            // Both patterns anchor on `<task>: <n>`; the bounded one also
            // requires `/<total>`. Percentages some tools interleave are
            // tolerated between count and total.
            bounded: Regex::new(r"^(?P<task>.+?): +(?:\d+% +)?\(?(?P<cur>\d+)/(?P<total>\d+)\)?").expect("static pattern"),
            unbounded: Regex::new(r"^(?P<task>.+?): +(?P<cur>\d+)").expect("static pattern"),
            partial: String::new(),
            current_task: None,
        }
    }

    /// Feed raw channel-2 bytes, returning all events completed by them.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        for byte in bytes {
            match byte {
                b'\r' | b'\n' => {
                    if !self.partial.is_empty() {
                        let line = std::mem::take(&mut self.partial);
                        if let Some(event) = self.parse_line(&line) {
                            events.push(event);
                        }
                    }
                }
                other => self.partial.push(char::from(*other)),
            }
        }
        events
    }

    /// The task most recently seen, if any.
    pub fn current_task(&self) -> Option<&str> {
        self.current_task.as_deref()
    }

    fn parse_line(&mut self, line: &str) -> Option<ProgressEvent> {
        if let Some(caps) = self.bounded.captures(line) {
            let task = caps.name("task").expect("named group").as_str();
            let current = caps.name("cur").expect("named group").as_str().parse().ok()?;
            let total = caps.name("total").expect("named group").as_str().parse().ok()?;
            return Some(self.counter(task, current, Some(total)));
        }
        if let Some(caps) = self.unbounded.captures(line) {
            let task = caps.name("task").expect("named group").as_str();
            let current = caps.name("cur").expect("named group").as_str().parse().ok()?;
            return Some(self.counter(task, current, None));
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(ProgressEvent::Message(trimmed.to_owned()))
        }
    }

    fn counter(&mut self, task: &str, current: u64, total: Option<u64>) -> ProgressEvent {
        let starts_task = self.current_task.as_deref() != Some(task);
        if starts_task {
            self.current_task = Some(task.to_owned());
        }
        ProgressEvent::Counter {
            task: task.to_owned(),
            current,
            total,
            starts_task,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn bounded_lines_are_scraped() {
        let mut parser = ProgressParser::new();
        let events = parser.feed(b"Counting objects: 10% (1/10)\r");
        assert_eq!(
            events,
            vec![ProgressEvent::Counter {
                task: "Counting objects".into(),
                current: 1,
                total: Some(10),
                starts_task: true,
            }]
        );
    }

    #[test]
    fn unbounded_lines_are_scraped() {
        let mut parser = ProgressParser::new();
        let events = parser.feed(b"Counting objects: 7\r");
        assert_eq!(
            events,
            vec![ProgressEvent::Counter {
                task: "Counting objects".into(),
                current: 7,
                total: None,
                starts_task: true,
            }]
        );
    }

    #[test]
    fn partial_lines_are_buffered_across_packets() {
        let mut parser = ProgressParser::new();
        assert!(parser.feed(b"Compressing obj").is_empty());
        let events = parser.feed(b"ects: 3/4\n");
        assert_eq!(
            events,
            vec![ProgressEvent::Counter {
                task: "Compressing objects".into(),
                current: 3,
                total: Some(4),
                starts_task: true,
            }]
        );
    }

    #[test]
    fn task_change_resets_baseline() {
        let mut parser = ProgressParser::new();
        parser.feed(b"Counting objects: 1/2\r");
        let events = parser.feed(b"Counting objects: 2/2\rWriting objects: 1/9\r");
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            ProgressEvent::Counter { starts_task: false, .. }
        ));
        assert!(matches!(
            &events[1],
            ProgressEvent::Counter { task, starts_task: true, .. } if task == "Writing objects"
        ));
    }

    #[test]
    fn unmatched_lines_become_messages() {
        let mut parser = ProgressParser::new();
        let events = parser.feed(b"remote: resolving deltas took a while\n");
        assert_eq!(
            events,
            vec![ProgressEvent::Message("remote: resolving deltas took a while".into())]
        );
    }
}
