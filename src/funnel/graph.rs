//! Funnel graph: static message-to-successor transition table.
//!
//! Lookups consult the primary table first, then the override table. A miss
//! in both means the message is terminal and its track ends.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

/// The hop that follows a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunnelStep {
    pub next_message_id: String,
    pub delay_minutes: u32,
}

impl FunnelStep {
    pub fn delay(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.delay_minutes))
    }
}

/// Immutable transition table, built once at startup.
#[derive(Debug, Clone)]
pub struct FunnelGraph {
    primary: HashMap<String, FunnelStep>,
    overrides: HashMap<String, FunnelStep>,
    reminder_messages: HashSet<String>,
    main_entry: String,
}

impl FunnelGraph {
    /// Empty graph whose main track starts at `main_entry`.
    pub fn new(main_entry: impl Into<String>) -> Self {
        Self {
            primary: HashMap::new(),
            overrides: HashMap::new(),
            reminder_messages: HashSet::new(),
            main_entry: main_entry.into(),
        }
    }

    /// Add a nurture-sequence hop to the primary table.
    pub fn step(mut self, from: &str, to: &str, delay_minutes: u32) -> Self {
        self.primary.insert(from.to_string(), step(to, delay_minutes));
        self
    }

    /// Add a hop to the override table, consulted only on a primary miss.
    pub fn override_step(mut self, from: &str, to: &str, delay_minutes: u32) -> Self {
        self.overrides.insert(from.to_string(), step(to, delay_minutes));
        self
    }

    /// Add a reminder-sequence hop. Both ends are tagged as reminder messages.
    pub fn reminder_step(mut self, from: &str, to: &str, delay_minutes: u32) -> Self {
        self.reminder_messages.insert(from.to_string());
        self.reminder_messages.insert(to.to_string());
        self.primary.insert(from.to_string(), step(to, delay_minutes));
        self
    }

    /// Successor of `message_id`, or `None` when it is terminal.
    pub fn next_step(&self, message_id: &str) -> Option<&FunnelStep> {
        self.primary
            .get(message_id)
            .or_else(|| self.overrides.get(message_id))
    }

    /// Whether `message_id` belongs to the reminder sequence rather than the nurture funnel.
    pub fn is_reminder_message(&self, message_id: &str) -> bool {
        self.reminder_messages.contains(message_id)
    }

    /// First message of the nurture funnel, used for recovery sends.
    pub fn main_entry(&self) -> &str {
        &self.main_entry
    }

    /// Every message id that has an outgoing hop.
    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.primary
            .keys()
            .chain(self.overrides.keys())
            .map(String::as_str)
    }

    /// Follow hops from `message_id` and report whether a terminal message is reached.
    pub fn terminates_from(&self, message_id: &str) -> bool {
        let mut seen = HashSet::new();
        let mut current = message_id.to_string();
        while let Some(next) = self.next_step(&current) {
            if !seen.insert(current.clone()) {
                return false;
            }
            current = next.next_message_id.clone();
        }
        true
    }

    /// The graph the bot ships with.
    pub fn shipped() -> Self {
        FunnelGraph::new("message_1")
            .step("message_1", "message_2", 60)
            .step("message_2", "message_3", 24 * 60)
            .step("message_3", "message_4", 24 * 60)
            .step("message_4", "message_5", 48 * 60)
            .step("message_5", "message_6", 48 * 60)
            .step("message_6", "message_7", 72 * 60)
            .override_step("message_file_followup", "message_5", 23 * 60 + 50)
            .override_step("message_3_1", "message_4", 10)
            .reminder_step("consult_reminder_1", "consult_reminder_2", 60)
            .reminder_step("consult_reminder_2", "consult_reminder_3", 24 * 60)
    }

    /// Load a graph from a JSON file (see [`GraphFile`]).
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let file: GraphFile =
            serde_json::from_str(raw).map_err(|e| ConfigError::ParseError(format!("funnel graph: {e}")))?;

        let mut graph = FunnelGraph::new(file.main_entry);
        for edge in file.steps {
            graph = if edge.reminder {
                graph.reminder_step(&edge.from, &edge.to, edge.delay_minutes)
            } else {
                graph.step(&edge.from, &edge.to, edge.delay_minutes)
            };
        }
        for edge in file.overrides {
            graph = graph.override_step(&edge.from, &edge.to, edge.delay_minutes);
        }
        Ok(graph)
    }
}

fn step(to: &str, delay_minutes: u32) -> FunnelStep {
    FunnelStep {
        next_message_id: to.to_string(),
        delay_minutes,
    }
}

/// On-disk graph format.
#[derive(Debug, Deserialize)]
pub struct GraphFile {
    pub main_entry: String,
    #[serde(default)]
    pub steps: Vec<GraphEdge>,
    #[serde(default)]
    pub overrides: Vec<GraphEdge>,
}

#[derive(Debug, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    pub delay_minutes: u32,
    #[serde(default)]
    pub reminder: bool,
}
