//! Inactivity reclaimer: resets users who have gone quiet.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::config::ReclaimerConfig;
use crate::error::FunnelError;
use crate::funnel::record::ScheduleRecord;
use crate::store::ScheduleStore;

pub struct InactivityReclaimer {
    store: Arc<dyn ScheduleStore>,
    threshold: chrono::Duration,
}

impl InactivityReclaimer {
    pub fn new(store: Arc<dyn ScheduleStore>, config: &ReclaimerConfig) -> Self {
        Self {
            store,
            threshold: chrono::Duration::from_std(config.inactivity_threshold)
                .unwrap_or(chrono::Duration::days(4)),
        }
    }

    /// Idle for strictly longer than the threshold.
    pub fn is_record_inactive(&self, record: &ScheduleRecord, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(record.last_activity_at) > self.threshold
    }

    pub async fn is_inactive(&self, user_id: &str) -> Result<bool, FunnelError> {
        self.is_inactive_at(user_id, Utc::now()).await
    }

    pub async fn is_inactive_at(&self, user_id: &str, now: DateTime<Utc>) -> Result<bool, FunnelError> {
        let record = self.load(user_id).await?;
        Ok(self.is_record_inactive(&record, now))
    }

    /// Clear both tracks, the form state and the stop flag. History is kept.
    pub async fn reset(&self, user_id: &str) -> Result<(), FunnelError> {
        let mut record = self.load(user_id).await?;
        record.reset();
        self.store.put_record(&record).await?;
        info!(user_id, "Schedule state reset");
        Ok(())
    }

    /// Reset every inactive record that is stuck: stopped, halted, or holding
    /// questionnaire state with nothing pending. Users still moving through a
    /// track are left alone, since quiet users are who the nudges are for.
    ///
    /// Returns the number of records reset.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<usize, FunnelError> {
        let records = self.store.list_records().await?;
        let mut reset = 0;

        for mut record in records {
            let stuck = record.stopped || record.is_halted() || record.form_state.is_some();
            if record.has_pending() || !stuck || !self.is_record_inactive(&record, now) {
                continue;
            }
            record.reset();
            match self.store.put_record(&record).await {
                Ok(()) => reset += 1,
                Err(e) => error!(user_id = %record.user_id, "Reclaim write failed: {e}"),
            }
        }

        if reset > 0 {
            info!(reset, "Reclaimer sweep complete");
        }
        Ok(reset)
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
