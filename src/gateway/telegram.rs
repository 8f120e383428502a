//! Telegram gateway: delivers funnel messages through the Bot API `sendMessage`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::ExposeSecret;
use serde::Deserialize;

use crate::config::TelegramConfig;
use crate::error::DeliveryError;
use crate::gateway::{DeliveryReceipt, MessageGateway, RenderedMessage};

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

const GATEWAY_NAME: &str = "telegram";

/// Bot API gateway.
pub struct TelegramGateway {
    config: TelegramConfig,
    api_base: String,
    client: reqwest::Client,
}

/// Subset of the Bot API response envelope we care about.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    result: Option<SentMessage>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

impl TelegramGateway {
    /// Build a gateway whose HTTP calls are bounded by `timeout`.
    pub fn new(config: TelegramConfig, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Falling back to default HTTP client: {e}");
                reqwest::Client::new()
            });
        Self {
            config,
            api_base: "https://api.telegram.org".to_string(),
            client,
        }
    }

    /// Point the gateway at a different Bot API host (local bot server, tests).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base,
            self.config.bot_token.expose_secret()
        )
    }

    /// Send one chunk (≤4096 chars). Falls back to plain text if the markup is rejected.
    async fn send_chunk(
        &self,
        chat_id: &str,
        text: &str,
        reply_markup: Option<&serde_json::Value>,
    ) -> Result<Option<i64>, DeliveryError> {
        let mut body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": self.config.parse_mode,
        });
        if let Some(markup) = reply_markup {
            body["reply_markup"] = markup.clone();
        }

        match self.post_send_message(&body).await {
            Err(DeliveryError::Permanent { reason, .. }) if is_markup_error(&reason) => {
                tracing::warn!(
                    chat_id,
                    "Telegram rejected {} markup; retrying without parse_mode",
                    self.config.parse_mode
                );
                if let Some(obj) = body.as_object_mut() {
                    obj.remove("parse_mode");
                }
                self.post_send_message(&body).await
            }
            other => other,
        }
    }

    async fn post_send_message(
        &self,
        body: &serde_json::Value,
    ) -> Result<Option<i64>, DeliveryError> {
        let resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(body)
            .send()
            .await
            .map_err(|e| DeliveryError::transient(GATEWAY_NAME, e.without_url().to_string()))?;

        let status = resp.status();
        let parsed: Option<ApiResponse> = resp.json().await.ok();

        if status.is_success() && parsed.as_ref().is_none_or(|p| p.ok) {
            return Ok(parsed.and_then(|p| p.result).map(|m| m.message_id));
        }

        let description = parsed
            .and_then(|p| p.description)
            .unwrap_or_else(|| status.to_string());
        Err(classify_response(status.as_u16(), &description))
    }
}

#[async_trait]
impl MessageGateway for TelegramGateway {
    fn name(&self) -> &str {
        GATEWAY_NAME
    }

    async fn send(
        &self,
        destination: &str,
        message: &RenderedMessage,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let chunks = split_message(&message.text, TELEGRAM_MAX_MESSAGE_LENGTH);
        let markup = (!message.buttons.is_empty())
            .then(|| serde_json::json!({ "inline_keyboard": message.buttons }));

        let mut last_id = None;
        let last_idx = chunks.len().saturating_sub(1);
        for (idx, chunk) in chunks.iter().enumerate() {
            // Buttons ride on the final chunk only
            let chunk_markup = if idx == last_idx { markup.as_ref() } else { None };
            last_id = self.send_chunk(destination, chunk, chunk_markup).await?;
        }

        Ok(DeliveryReceipt {
            gateway_message_id: last_id.map(|id| id.to_string()),
            delivered_at: Utc::now(),
        })
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Map a failed Bot API response onto the retry taxonomy.
///
/// 403 (blocked, kicked, deactivated) and unknown chats are permanent. Rate
/// limits, server errors and anything unrecognised are transient.
pub fn classify_response(status: u16, description: &str) -> DeliveryError {
    let lower = description.to_lowercase();
    let permanent = status == 403
        || (status == 400
            && (lower.contains("chat not found")
                || lower.contains("user is deactivated")
                || lower.contains("peer_id_invalid")
                || lower.contains("can't parse entities")));

    let reason = format!("{status}: {description}");
    if permanent {
        DeliveryError::permanent(GATEWAY_NAME, reason)
    } else {
        DeliveryError::transient(GATEWAY_NAME, reason)
    }
}

fn is_markup_error(reason: &str) -> bool {
    reason.to_lowercase().contains("can't parse entities")
}

/// Split a message into chunks that fit Telegram's character limit.
/// Tries to split on newlines, then spaces, then hard-cuts on a char boundary.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut limit = max_len;
        while limit > 0 && !remaining.is_char_boundary(limit) {
            limit -= 1;
        }
        let chunk = &remaining[..limit];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(limit);

        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { limit } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

// ── Tests ───────────────────────────────────────────────────────────
