//! Per-session command history with arrow-key navigation

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Entries kept per session
pub const MAX_HISTORY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryDirection {
    Up,
    Down,
}

/// Navigation result; `index == -1` means "past the newest entry" (empty line)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub command: String,
    pub index: i64,
}

#[derive(Debug, Default)]
pub struct CommandHistory {
    entries: VecDeque<String>,
}

impl CommandHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a command. Blank commands and repeats of the newest entry are skipped.
    pub fn push(&mut self, command: &str) {
        let command = command.trim();
        if command.is_empty() || self.entries.back().map(String::as_str) == Some(command) {
            return;
        }
        if self.entries.len() == MAX_HISTORY {
            self.entries.pop_front();
        }
        self.entries.push_back(command.to_string());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Step from `current` in `direction`.
    ///
    /// Up from the start (or from -1) wraps to the newest entry; down past the
    /// newest returns -1 with an empty command.
    pub fn navigate(&self, direction: HistoryDirection, current: i64) -> HistoryEntry {
        let max = self.entries.len() as i64 - 1;
        let index = match direction {
            HistoryDirection::Up if current > 0 => (current - 1).min(max),
            HistoryDirection::Up => max,
            HistoryDirection::Down if current >= 0 && current < max => current + 1,
            HistoryDirection::Down => -1,
        };

        let command = usize::try_from(index)
            .ok()
            .and_then(|i| self.entries.get(i))
            .cloned()
            .unwrap_or_default();
        HistoryEntry { command, index }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(commands: &[&str]) -> CommandHistory {
        let mut h = CommandHistory::new();
        for c in commands {
            h.push(c);
        }
        h
    }

    #[test]
    fn test_dedup_and_blank() {
        let h = history(&["ls", "ls", "  ", "pwd", "ls"]);
        assert_eq!(h.len(), 3);
    }

    #[test]
    fn test_bounded() {
        let mut h = CommandHistory::new();
        for i in 0..(MAX_HISTORY + 20) {
            h.push(&format!("echo {}", i));
        }
        assert_eq!(h.len(), MAX_HISTORY);
        assert_eq!(h.navigate(HistoryDirection::Up, -1).command, format!("echo {}", MAX_HISTORY + 19));
        assert_eq!(h.navigate(HistoryDirection::Down, -1).index, -1);
    }

    #[test]
    fn test_navigation() {
        let h = history(&["ls", "pwd", "whoami"]);

        let newest = h.navigate(HistoryDirection::Up, -1);
        assert_eq!(newest, HistoryEntry { command: "whoami".into(), index: 2 });

        let older = h.navigate(HistoryDirection::Up, newest.index);
        assert_eq!(older.command, "pwd");

        let back = h.navigate(HistoryDirection::Down, older.index);
        assert_eq!(back.command, "whoami");

        let past_end = h.navigate(HistoryDirection::Down, back.index);
        assert_eq!(past_end, HistoryEntry { command: String::new(), index: -1 });
    }

    #[test]
    fn test_empty_history() {
        let h = CommandHistory::new();
        assert_eq!(h.navigate(HistoryDirection::Up, -1).index, -1);
        assert_eq!(h.navigate(HistoryDirection::Up, 0).command, "");
    }
}
