//! Follow-up dispatcher: the polling loop that sends due funnel messages.
//!
//! Each cycle scans every schedule record, re-reads the ones with a due slot,
//! and for each user:
//! - both tracks due: the reminder goes out, the main slot is pushed back by
//!   the conflict grace period
//! - reminder due: send, advance; a direct-link user who reaches the end of
//!   the reminders is re-seeded into the main funnel after a delay
//! - main due: send, advance, drop stale questionnaire state
//!
//! The due slot is cleared in the store before the gateway is called. Once
//! the outcome is known the record is re-read and only the send result is
//! merged in, so a stop or reply written during the send survives.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::config::DispatcherConfig;
use crate::error::DatabaseError;
use crate::funnel::delivery::{Courier, SendOutcome, reload_after_send};
use crate::funnel::graph::FunnelGraph;
use crate::funnel::reclaimer::InactivityReclaimer;
use crate::funnel::record::{EntryPoint, ScheduleRecord, Track, TrackSlot};
use crate::store::ScheduleStore;

/// Tallies for one dispatcher cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub scanned: usize,
    pub sent: usize,
    pub retried: usize,
    pub exhausted: usize,
    pub unreachable: usize,
    pub no_content: usize,
    /// Main-track sends pushed back by a reminder conflict.
    pub deferred: usize,
    /// Recovery sends scheduled for direct-link users.
    pub recovered: usize,
    pub store_errors: usize,
}

impl CycleReport {
    fn tally(&mut self, outcome: &SendOutcome) {
        match outcome {
            SendOutcome::Delivered(_) => self.sent += 1,
            SendOutcome::RetryScheduled { .. } => self.retried += 1,
            SendOutcome::RetriesExhausted => self.exhausted += 1,
            SendOutcome::Unreachable => self.unreachable += 1,
            SendOutcome::NoContent => self.no_content += 1,
            SendOutcome::Skipped => {}
        }
    }
}

pub struct Dispatcher {
    store: Arc<dyn ScheduleStore>,
    graph: Arc<FunnelGraph>,
    courier: Arc<Courier>,
    conflict_grace: chrono::Duration,
    recovery_delay: chrono::Duration,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        graph: Arc<FunnelGraph>,
        courier: Arc<Courier>,
        config: &DispatcherConfig,
    ) -> Self {
        Self {
            store,
            graph,
            courier,
            conflict_grace: to_chrono(config.conflict_grace, 10),
            recovery_delay: to_chrono(config.recovery_delay, 60),
        }
    }

    pub async fn run_cycle(&self) -> CycleReport {
        self.run_cycle_at(Utc::now()).await
    }

    /// One full scan with `now` as the clock.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> CycleReport {
        let mut report = CycleReport::default();

        let records = match self.store.list_records().await {
            Ok(records) => records,
            Err(e) => {
                error!("Failed to scan schedule records: {e}");
                report.store_errors += 1;
                return report;
            }
        };
        report.scanned = records.len();

        for scanned in records {
            if !scanned.is_due(Track::Main, now) && !scanned.is_due(Track::Reminder, now) {
                continue;
            }
            if let Err(e) = self.process_user(&scanned.user_id, now, &mut report).await {
                error!(user_id = %scanned.user_id, "Dispatch failed, moving on: {e}");
                report.store_errors += 1;
            }
        }

        info!(
            scanned = report.scanned,
            sent = report.sent,
            retried = report.retried,
            exhausted = report.exhausted,
            unreachable = report.unreachable,
            deferred = report.deferred,
            store_errors = report.store_errors,
            "Dispatch cycle complete"
        );
        report
    }

    async fn process_user(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<(), DatabaseError> {
        // The scan may be stale: a reply or stop since then must win
        let Some(record) = self.store.get_record(user_id).await? else {
            return Ok(());
        };
        if record.stopped {
            debug!(user_id, "Stopped since scan; skipping");
            return Ok(());
        }

        match (record.is_due(Track::Main, now), record.is_due(Track::Reminder, now)) {
            (true, true) => self.dispatch_conflict(record, now, report).await,
            (false, true) => self.dispatch_reminder(record, now, report).await,
            (true, false) => self.dispatch_main(record, now, report).await,
            (false, false) => {
                debug!(user_id, "No longer due; skipping");
                Ok(())
            }
        }
    }

    /// Both due: reminder first, main deferred by the grace period.
    async fn dispatch_conflict(
        &self,
        mut record: ScheduleRecord,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<(), DatabaseError> {
        let Some(reminder) = record.clear_slot(Track::Reminder) else {
            return Ok(());
        };

        if let Some(main) = record.main_track.as_mut() {
            // A nurture message taking over abandons any half-done questionnaire
            if !self.graph.is_reminder_message(&main.message_id) {
                record.form_state = None;
            }
            main.run_at = now + self.conflict_grace;
            report.deferred += 1;
            debug!(
                user_id = %record.user_id,
                message_id = %main.message_id,
                run_at = %main.run_at,
                "Main track deferred behind reminder"
            );
        }

        self.store.put_record(&record).await?;
        self.send_reminder(record, reminder, now, report).await
    }

    async fn dispatch_reminder(
        &self,
        mut record: ScheduleRecord,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<(), DatabaseError> {
        let Some(reminder) = record.clear_slot(Track::Reminder) else {
            return Ok(());
        };
        self.store.put_record(&record).await?;
        self.send_reminder(record, reminder, now, report).await
    }

    async fn send_reminder(
        &self,
        mut record: ScheduleRecord,
        slot: TrackSlot,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<(), DatabaseError> {
        let outcome = self
            .courier
            .deliver(&mut record, Track::Reminder, &slot, now)
            .await;
        report.tally(&outcome);

        let mut record = reload_after_send(self.store.as_ref(), Track::Reminder, record).await?;
        if matches!(outcome, SendOutcome::Delivered(_)) {
            match self.graph.next_step(&slot.message_id) {
                Some(step) => {
                    record.schedule_if_idle(
                        Track::Reminder,
                        TrackSlot::new(&step.next_message_id, now + step.delay()),
                    );
                }
                None if record.entry_point == Some(EntryPoint::DirectReminder) => {
                    let run_at = now + self.recovery_delay;
                    let seed = TrackSlot::new(self.graph.main_entry(), run_at);
                    if record.schedule_if_idle(Track::Main, seed) {
                        report.recovered += 1;
                        info!(user_id = %record.user_id, %run_at, "Reminders exhausted; recovery send scheduled");
                    }
                }
                None => {}
            }
        }

        self.store.put_record(&record).await
    }

    async fn dispatch_main(
        &self,
        mut record: ScheduleRecord,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<(), DatabaseError> {
        let Some(slot) = record.clear_slot(Track::Main) else {
            return Ok(());
        };
        self.store.put_record(&record).await?;
        let form_before = record.form_state.clone();

        let outcome = self
            .courier
            .deliver(&mut record, Track::Main, &slot, now)
            .await;
        report.tally(&outcome);

        let mut record = reload_after_send(self.store.as_ref(), Track::Main, record).await?;
        if matches!(outcome, SendOutcome::Delivered(_)) {
            // A questionnaire step the user entered during the send is live
            if record.form_state == form_before {
                record.form_state = None;
            }
            if let Some(step) = self.graph.next_step(&slot.message_id) {
                record.schedule_if_idle(
                    Track::Main,
                    TrackSlot::new(&step.next_message_id, now + step.delay()),
                );
            } else {
                debug!(user_id = %record.user_id, message_id = %slot.message_id, "End of funnel");
            }
        }

        self.store.put_record(&record).await
    }
}

fn to_chrono(d: Duration, fallback_minutes: i64) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::minutes(fallback_minutes))
}

/// Spawn the dispatcher ticker background task.
///
/// Cycles run back to back on `interval`; a slow cycle delays the next tick
/// rather than bunching ticks up. The reclaimer sweep, when given, runs after
/// every cycle.
pub fn spawn_dispatcher(
    dispatcher: Arc<Dispatcher>,
    reclaimer: Option<Arc<InactivityReclaimer>>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            dispatcher.run_cycle().await;
            if let Some(ref reclaimer) = reclaimer {
                if let Err(e) = reclaimer.sweep_at(Utc::now()).await {
                    error!("Reclaimer sweep failed: {e}");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funnel::delivery::SendOutcome;
    use crate::gateway::DeliveryReceipt;

    #[test]
    fn report_tally() {
        let mut report = CycleReport::default();
        report.tally(&SendOutcome::Delivered(DeliveryReceipt {
            gateway_message_id: None,
            delivered_at: Utc::now(),
        }));
        report.tally(&SendOutcome::RetryScheduled {
            attempt: 1,
            run_at: Utc::now(),
        });
        report.tally(&SendOutcome::RetriesExhausted);
        report.tally(&SendOutcome::Unreachable);
        report.tally(&SendOutcome::Skipped);
        assert_eq!(report.sent, 1);
        assert_eq!(report.retried, 1);
        assert_eq!(report.exhausted, 1);
        assert_eq!(report.unreachable, 1);
    }

    #[test]
    fn chrono_conversion_fallback() {
        assert_eq!(to_chrono(Duration::from_secs(600), 1), chrono::Duration::minutes(10));
    }
}
