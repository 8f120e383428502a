//! Single delivery attempt and its effect on a schedule record.
//!
//! Shared by the dispatcher (due slots) and the track controller (entry
//! messages). `Courier` never touches the store; callers re-read the record
//! after the gateway call with [`reload_after_send`] and persist the merge.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::{DatabaseError, DeliveryError};
use crate::funnel::record::{ScheduleRecord, SendStatus, Track, TrackSlot};
use crate::funnel::retry::{RetryDecision, RetryPolicy};
use crate::gateway::{DeliveryReceipt, MessageGateway, MessageRenderer};
use crate::store::ScheduleStore;

/// What happened to one attempt, after the record was updated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered(DeliveryReceipt),
    /// Transient failure; the same message is back on the track at `run_at`.
    RetryScheduled { attempt: u32, run_at: DateTime<Utc> },
    /// Transient failure with no retries left; the track is halted.
    RetriesExhausted,
    /// Permanent failure; the user is stopped.
    Unreachable,
    /// The renderer has no content for the message; the track is halted.
    NoContent,
    /// Not attempted because the user is stopped.
    Skipped,
}

/// Renders, sends and books the result of a delivery.
pub struct Courier {
    gateway: Arc<dyn MessageGateway>,
    renderer: Arc<dyn MessageRenderer>,
    policy: RetryPolicy,
    send_timeout: Duration,
}

impl Courier {
    pub fn new(
        gateway: Arc<dyn MessageGateway>,
        renderer: Arc<dyn MessageRenderer>,
        policy: RetryPolicy,
        send_timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            renderer,
            policy,
            send_timeout,
        }
    }

    /// Whether the renderer knows `message_id`.
    pub fn can_render(&self, message_id: &str) -> bool {
        self.renderer.render(message_id, None).is_some()
    }

    /// Attempt `slot` for `record` on `track`, then record the outcome.
    ///
    /// On success only `last_send` changes; scheduling the next hop is the
    /// caller's job. Failures rewrite the track slot or the stop flag. The
    /// retry budget is read from `slot.attempt`, so sends on the other track
    /// never reset it.
    pub async fn deliver(
        &self,
        record: &mut ScheduleRecord,
        track: Track,
        slot: &TrackSlot,
        now: DateTime<Utc>,
    ) -> SendOutcome {
        let message_id = slot.message_id.as_str();
        let Some(rendered) = self
            .renderer
            .render(message_id, record.display_name.as_deref())
        else {
            warn!(user_id = %record.user_id, message_id, %track, "No content for message; halting track");
            record.record_send(message_id, now, SendStatus::Error);
            return SendOutcome::NoContent;
        };

        let result = match tokio::time::timeout(
            self.send_timeout,
            self.gateway.send(&record.chat_destination, &rendered),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::transient(
                self.gateway.name(),
                format!("send timed out after {:?}", self.send_timeout),
            )),
        };

        match result {
            Ok(receipt) => {
                info!(user_id = %record.user_id, message_id, %track, "Delivered");
                record.record_send(message_id, now, SendStatus::Ok);
                SendOutcome::Delivered(receipt)
            }
            Err(e @ DeliveryError::Permanent { .. }) => {
                warn!(user_id = %record.user_id, message_id, %track, "Permanent delivery failure, stopping user: {e}");
                record.stop();
                record.record_send(message_id, now, SendStatus::Error);
                SendOutcome::Unreachable
            }
            Err(e @ DeliveryError::Transient { .. }) => {
                match self.policy.decide(slot.attempt, now) {
                    RetryDecision::Retry { attempt, run_at } => {
                        warn!(
                            user_id = %record.user_id, message_id, %track, attempt,
                            retry_at = %run_at,
                            "Transient delivery failure, retry scheduled: {e}"
                        );
                        record.set_slot(track, TrackSlot::retry(message_id, run_at, attempt));
                        record.record_send(message_id, now, SendStatus::Retry(attempt));
                        SendOutcome::RetryScheduled { attempt, run_at }
                    }
                    RetryDecision::Exhausted => {
                        tracing::error!(
                            user_id = %record.user_id, message_id, %track,
                            "Retries exhausted, track halted: {e}"
                        );
                        record.record_send(message_id, now, SendStatus::FailedMaxRetries);
                        SendOutcome::RetriesExhausted
                    }
                }
            }
        }
    }
}

/// Re-read `sent.user_id` after a gateway call and fold the send outcome in,
/// so writes made by the conversation layer during the call survive.
pub async fn reload_after_send(
    store: &dyn ScheduleStore,
    track: Track,
    sent: ScheduleRecord,
) -> Result<ScheduleRecord, DatabaseError> {
    match store.get_record(&sent.user_id).await? {
        Some(mut fresh) => {
            fresh.absorb_send(track, &sent);
            Ok(fresh)
        }
        None => Ok(sent),
    }
}
