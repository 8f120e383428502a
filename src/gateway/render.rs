//! Message rendering: turns a message id plus recipient metadata into content.

use std::collections::HashMap;
use std::path::Path;

use crate::error::ConfigError;
use crate::gateway::RenderedMessage;

/// Rendering collaborator consulted before every send.
pub trait MessageRenderer: Send + Sync {
    /// Render `message_id` for a recipient. `None` means the id has no content.
    fn render(&self, message_id: &str, recipient_name: Option<&str>) -> Option<RenderedMessage>;
}

/// Static catalog of message templates keyed by message id.
///
/// When the recipient's name is known it is prepended as `"{name}, "`.
#[derive(Debug, Clone, Default)]
pub struct CatalogRenderer {
    templates: HashMap<String, RenderedMessage>,
}

impl CatalogRenderer {
    pub fn new(templates: HashMap<String, RenderedMessage>) -> Self {
        Self { templates }
    }

    /// Load a catalog from a JSON object of `{ "message_id": { "text": ..., "buttons": [[...]] } }`.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let templates: HashMap<String, RenderedMessage> = serde_json::from_str(raw)
            .map_err(|e| ConfigError::ParseError(format!("message catalog: {e}")))?;
        Ok(Self::new(templates))
    }

    /// Neutral placeholder copy for every message in the shipped graph.
    pub fn builtin() -> Self {
        let entries = [
            ("message_1", "Thanks for joining! Here is what we will cover over the next few days."),
            ("message_2", "A quick follow-up with the first practical tip."),
            ("message_3", "Here is a case study you might find useful."),
            ("message_3_1", "One more detail on yesterday's topic."),
            ("message_4", "Common mistakes and how to avoid them."),
            ("message_5", "Ready to apply this to your business?"),
            ("message_6", "A short checklist to get started."),
            ("message_7", "Last note from us. Reach out any time."),
            ("message_file_followup", "Did the file help? Here is what to do next."),
            ("consult_reminder_1", "You started booking a consultation. Want to finish?"),
            ("consult_reminder_2", "Your consultation slot is still open."),
            ("consult_reminder_3", "Last reminder about your consultation."),
        ];
        Self::new(
            entries
                .into_iter()
                .map(|(id, text)| (id.to_string(), RenderedMessage::text(text)))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl MessageRenderer for CatalogRenderer {
    fn render(&self, message_id: &str, recipient_name: Option<&str>) -> Option<RenderedMessage> {
        let template = self.templates.get(message_id)?;
        let mut rendered = template.clone();
        if let Some(name) = recipient_name.map(str::trim).filter(|n| !n.is_empty()) {
            rendered.text = format!("{name}, {}", rendered.text);
        }
        Some(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funnel::graph::FunnelGraph;

    #[test]
    fn renders_with_name_prefix() {
        let renderer = CatalogRenderer::builtin();
        let msg = renderer.render("message_2", Some("Ivan")).unwrap();
        assert!(msg.text.starts_with("Ivan, "));

        let anon = renderer.render("message_2", None).unwrap();
        assert!(!anon.text.contains(", A quick"));
    }

    #[test]
    fn blank_name_is_ignored() {
        let renderer = CatalogRenderer::builtin();
        let msg = renderer.render("message_1", Some("  ")).unwrap();
        assert!(msg.text.starts_with("Thanks"));
    }

    #[test]
    fn unknown_message_is_none() {
        assert!(CatalogRenderer::builtin().render("nope", None).is_none());
    }

    #[test]
    fn builtin_covers_shipped_graph() {
        let renderer = CatalogRenderer::builtin();
        let graph = FunnelGraph::shipped();
        for source in graph.sources() {
            assert!(renderer.render(source, None).is_some(), "{source}");
            let next = &graph.next_step(source).unwrap().next_message_id;
            assert!(renderer.render(next, None).is_some(), "{next}");
        }
    }

    #[test]
    fn load_catalog_with_buttons() {
        let raw = r#"{
            "message_1": {
                "text": "Hello",
                "buttons": [[{"text": "Site", "url": "https://example.com"},
                             {"text": "Book", "callback_data": "consultation"}]]
            }
        }"#;
        let renderer = CatalogRenderer::from_json_str(raw).unwrap();
        assert_eq!(renderer.len(), 1);
        let msg = renderer.render("message_1", None).unwrap();
        assert_eq!(msg.buttons[0].len(), 2);
        assert_eq!(msg.buttons[0][1].callback_data.as_deref(), Some("consultation"));
    }
}
