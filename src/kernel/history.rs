//! In-memory history manager.

use serde_json::{Value, json};
use std::sync::RwLock;

/// One stored cell
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub session: i64,
    pub line_number: i64,
    pub input: String,
}

/// Parsed `history_request` query
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryQuery {
    Tail { n: usize },
    Range { session: i64, start: i64, stop: i64 },
    Search { pattern: String, n: Option<usize>, unique: bool },
}

impl HistoryQuery {
    pub fn from_content(content: &Value) -> Option<Self> {
        let int = |key: &str| content.get(key).and_then(Value::as_i64);
        match content.get("hist_access_type").and_then(Value::as_str)? {
            "tail" => Some(HistoryQuery::Tail {
                n: int("n").unwrap_or(10).max(0) as usize,
            }),
            "range" => Some(HistoryQuery::Range {
                session: int("session").unwrap_or(0),
                start: int("start").unwrap_or(0),
                stop: int("stop").unwrap_or(i64::MAX),
            }),
            "search" => Some(HistoryQuery::Search {
                pattern: content
                    .get("pattern")
                    .and_then(Value::as_str)
                    .unwrap_or("*")
                    .to_string(),
                n: int("n").map(|n| n.max(0) as usize),
                unique: content
                    .get("unique")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            }),
            _ => None,
        }
    }
}

/// Stores executed cells so frontends can query them back
pub trait HistoryManager: Send + Sync {
    fn store_input(&self, line_number: i64, input: &str);
    fn query(&self, query: &HistoryQuery) -> Vec<HistoryEntry>;
}

/// History kept for the lifetime of the process; session is always 0
#[derive(Debug, Default)]
pub struct InMemoryHistory {
    entries: RwLock<Vec<HistoryEntry>>,
}

pub fn make_in_memory_history_manager() -> Box<dyn HistoryManager> {
    Box::new(InMemoryHistory::default())
}

impl HistoryManager for InMemoryHistory {
    fn store_input(&self, line_number: i64, input: &str) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.push(HistoryEntry {
            session: 0,
            line_number,
            input: input.to_string(),
        });
    }

    fn query(&self, query: &HistoryQuery) -> Vec<HistoryEntry> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        match query {
            HistoryQuery::Tail { n } => {
                let skip = entries.len().saturating_sub(*n);
                entries[skip..].to_vec()
            }
            HistoryQuery::Range {
                session,
                start,
                stop,
            } => entries
                .iter()
                .filter(|e| e.session == *session && e.line_number >= *start && e.line_number < *stop)
                .cloned()
                .collect(),
            HistoryQuery::Search { pattern, n, unique } => {
                let Ok(pattern) = glob::Pattern::new(pattern) else {
                    return Vec::new();
                };
                let mut matched: Vec<HistoryEntry> = Vec::new();
                // Newest first so `unique` keeps the latest occurrence
                for entry in entries.iter().rev() {
                    if !pattern.matches(&entry.input) {
                        continue;
                    }
                    if *unique && matched.iter().any(|m| m.input == entry.input) {
                        continue;
                    }
                    matched.push(entry.clone());
                    if n.is_some_and(|n| matched.len() >= n) {
                        break;
                    }
                }
                matched.reverse();
                matched
            }
        }
    }
}

/// `history` field of a `history_reply`
pub fn entries_to_json(entries: &[HistoryEntry]) -> Value {
    Value::Array(
        entries
            .iter()
            .map(|e| json!([e.session, e.line_number, e.input]))
            .collect(),
    )
}
