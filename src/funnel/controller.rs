//! Track controller: the entry points the conversation layer calls.
//!
//! Every operation reads the record, mutates it and writes it back. The only
//! message this module sends itself is the entry message of `start_track`.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::error::FunnelError;
use crate::funnel::delivery::{Courier, SendOutcome, reload_after_send};
use crate::funnel::graph::FunnelGraph;
use crate::funnel::reclaimer::InactivityReclaimer;
use crate::funnel::record::{EntryPoint, ScheduleRecord, Track, TrackSlot};
use crate::store::ScheduleStore;

/// User actions that mean the nurture nudges have done their job.
pub const IMPORTANT_ACTIONS: &[&str] = &[
    "consultation",
    "completed_consultation_form",
    "requested_files",
    "subscribed",
    "consultation_requested",
];

pub struct TrackController {
    store: Arc<dyn ScheduleStore>,
    graph: Arc<FunnelGraph>,
    courier: Arc<Courier>,
    reclaimer: Arc<InactivityReclaimer>,
}

impl TrackController {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        graph: Arc<FunnelGraph>,
        courier: Arc<Courier>,
        reclaimer: Arc<InactivityReclaimer>,
    ) -> Self {
        Self {
            store,
            graph,
            courier,
            reclaimer,
        }
    }

    /// Send `entry_message_id` now and schedule its successor on `track`.
    ///
    /// Any pending entry on the track is cleared first. A user idle past the
    /// inactivity threshold is reset before the track starts; a stopped user
    /// is left alone and `SendOutcome::Skipped` is returned. A stop that lands
    /// while the entry message is in flight is kept and nothing is scheduled.
    pub async fn start_track(
        &self,
        user_id: &str,
        destination: &str,
        track: Track,
        entry_message_id: &str,
    ) -> Result<SendOutcome, FunnelError> {
        if !self.courier.can_render(entry_message_id) {
            return Err(FunnelError::UnknownMessage {
                message_id: entry_message_id.to_string(),
            });
        }

        let now = Utc::now();
        let mut record = match self.store.get_record(user_id).await? {
            Some(mut existing) => {
                if self.reclaimer.is_record_inactive(&existing, now) {
                    info!(user_id, "Inactive user re-entering funnel; resetting schedule");
                    existing.reset();
                }
                existing
            }
            None => ScheduleRecord::new(user_id, destination, now),
        };
        record.chat_destination = destination.to_string();
        record.last_activity_at = now;

        if record.stopped {
            debug!(user_id, %track, "User stopped; start ignored");
            self.store.put_record(&record).await?;
            return Ok(SendOutcome::Skipped);
        }

        // New users and reset ones have no entry point yet
        let fresh = record.entry_point.is_none();
        record.clear_slot(track);
        match track {
            Track::Main => record.entry_point = Some(EntryPoint::Funnel),
            Track::Reminder if fresh => record.entry_point = Some(EntryPoint::DirectReminder),
            Track::Reminder => {}
        }
        self.store.put_record(&record).await?;

        let entry = TrackSlot::new(entry_message_id, now);
        let outcome = self.courier.deliver(&mut record, track, &entry, now).await;

        // Other writers may have touched the record during the send
        let mut record = reload_after_send(self.store.as_ref(), track, record).await?;
        if matches!(outcome, SendOutcome::Delivered(_)) {
            if let Some(step) = self.graph.next_step(entry_message_id) {
                record.schedule_if_idle(track, TrackSlot::new(&step.next_message_id, now + step.delay()));
            }
        }
        self.store.put_record(&record).await?;

        info!(user_id, %track, entry_message_id, ?outcome, "Track started");
        Ok(outcome)
    }

    /// The user replied before the pending nudge fired; cancel it.
    ///
    /// Returns whether anything was pending. A reply on the reminder track
    /// also withdraws a scheduled recovery send for direct-link users.
    pub async fn advance_on_user_reply(&self, user_id: &str, track: Track) -> Result<bool, FunnelError> {
        let mut record = self.load(user_id).await?;
        record.last_activity_at = Utc::now();

        let cancelled = record.clear_slot(track).is_some();
        if track == Track::Reminder
            && record.entry_point == Some(EntryPoint::DirectReminder)
            && record
                .main_track
                .as_ref()
                .is_some_and(|s| s.message_id == self.graph.main_entry())
        {
            record.clear_slot(Track::Main);
        }

        self.store.put_record(&record).await?;
        debug!(user_id, %track, cancelled, "User replied");
        Ok(cancelled)
    }

    /// Goal completed: freeze both tracks until `resume_track`.
    pub async fn stop_track(&self, user_id: &str) -> Result<(), FunnelError> {
        let mut record = self.load(user_id).await?;
        record.stop();
        self.store.put_record(&record).await?;
        info!(user_id, "Funnel stopped");
        Ok(())
    }

    /// Lift the stop flag so later `start_track` calls take effect.
    pub async fn resume_track(&self, user_id: &str) -> Result<(), FunnelError> {
        let mut record = self.load(user_id).await?;
        record.stopped = false;
        self.store.put_record(&record).await?;
        info!(user_id, "Funnel resumed");
        Ok(())
    }

    /// Note an observable user action. Important actions also cancel the
    /// pending main-track nudge.
    pub async fn record_activity(&self, user_id: &str, action: &str) -> Result<(), FunnelError> {
        let mut record = self.load(user_id).await?;
        record.last_activity_at = Utc::now();
        if IMPORTANT_ACTIONS.contains(&action) && record.clear_slot(Track::Main).is_some() {
            info!(user_id, action, "Important action; pending nudge cancelled");
        }
        self.store.put_record(&record).await?;
        Ok(())
    }

    /// Mark (or clear) the in-progress reminder questionnaire step.
    pub async fn set_form_state(&self, user_id: &str, state: Option<&str>) -> Result<(), FunnelError> {
        let mut record = self.load(user_id).await?;
        record.form_state = state.map(str::to_string);
        record.last_activity_at = Utc::now();
        self.store.put_record(&record).await?;
        Ok(())
    }

    /// Remember the name the user gave, for personalised copy.
    pub async fn set_display_name(&self, user_id: &str, name: &str) -> Result<(), FunnelError> {
        let mut record = self.load(user_id).await?;
        record.display_name = Some(name.trim().to_string()).filter(|n| !n.is_empty());
        self.store.put_record(&record).await?;
        Ok(())
    }

    async fn load(&self, user_id: &str) -> Result<ScheduleRecord, FunnelError> {
        self.store
            .get_record(user_id)
            .await?
            .ok_or_else(|| FunnelError::UnknownUser {
                user_id: user_id.to_string(),
            })
    }
}
