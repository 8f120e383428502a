//! Per-user schedule record: the only durable state the dispatcher relies on.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One of the two independent message sequences a user can be on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Track {
    /// General nurture funnel.
    Main,
    /// Consultation-booking reminder sequence.
    Reminder,
}

impl Track {
    pub fn as_str(&self) -> &'static str {
        match self {
            Track::Main => "main",
            Track::Reminder => "reminder",
        }
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Track {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" => Ok(Track::Main),
            "reminder" => Ok(Track::Reminder),
            other => Err(format!("unknown track: {other}")),
        }
    }
}

/// A pending entry on a track: which message fires next, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackSlot {
    pub message_id: String,
    pub run_at: DateTime<Utc>,
    /// Retries already spent on `message_id` by this track. Zero for a first attempt.
    #[serde(default)]
    pub attempt: u32,
}

impl TrackSlot {
    pub fn new(message_id: impl Into<String>, run_at: DateTime<Utc>) -> Self {
        Self {
            message_id: message_id.into(),
            run_at,
            attempt: 0,
        }
    }

    /// A re-queued message carrying its retry count.
    pub fn retry(message_id: impl Into<String>, run_at: DateTime<Utc>, attempt: u32) -> Self {
        Self {
            attempt,
            ..Self::new(message_id, run_at)
        }
    }

    /// Due means `run_at` is at or before `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.run_at <= now
    }
}

/// Outcome of the most recent delivery attempt on either track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Ok,
    Retry(u32),
    FailedMaxRetries,
    Error,
}

impl fmt::Display for SendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendStatus::Ok => f.write_str("OK"),
            SendStatus::Retry(n) => write!(f, "RETRY_{n}"),
            SendStatus::FailedMaxRetries => f.write_str("FAILED_MAX_RETRIES"),
            SendStatus::Error => f.write_str("ERROR"),
        }
    }
}

impl FromStr for SendStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OK" => Ok(SendStatus::Ok),
            "FAILED_MAX_RETRIES" => Ok(SendStatus::FailedMaxRetries),
            "ERROR" => Ok(SendStatus::Error),
            other => other
                .strip_prefix("RETRY_")
                .and_then(|n| n.parse().ok())
                .map(SendStatus::Retry)
                .ok_or_else(|| format!("unknown send status: {other}")),
        }
    }
}

/// Bookkeeping for the last message the dispatcher tried to deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastSend {
    pub message_id: String,
    pub sent_at: DateTime<Utc>,
    pub status: SendStatus,
}

/// How the user first reached the funnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryPoint {
    /// Came in through the general funnel.
    Funnel,
    /// Came in through a direct-to-consultation link.
    DirectReminder,
}

impl EntryPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryPoint::Funnel => "funnel",
            EntryPoint::DirectReminder => "direct_reminder",
        }
    }
}

impl FromStr for EntryPoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "funnel" => Ok(EntryPoint::Funnel),
            "direct_reminder" => Ok(EntryPoint::DirectReminder),
            other => Err(format!("unknown entry point: {other}")),
        }
    }
}

/// One row per user in the schedule store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleRecord {
    pub user_id: String,
    /// Opaque gateway address (a Telegram chat id).
    pub chat_destination: String,
    /// Recipient name, when the user has given one.
    pub display_name: Option<String>,
    pub main_track: Option<TrackSlot>,
    pub reminder_track: Option<TrackSlot>,
    /// Goal completed; both tracks frozen until resumed.
    pub stopped: bool,
    pub last_activity_at: DateTime<Utc>,
    /// Set while the reminder questionnaire is in progress.
    pub form_state: Option<String>,
    /// How the user entered. `None` until a track is first started, and again after a reset.
    pub entry_point: Option<EntryPoint>,
    pub last_send: Option<LastSend>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduleRecord {
    /// A fresh record for a user seen for the first time.
    pub fn new(user_id: impl Into<String>, chat_destination: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            chat_destination: chat_destination.into(),
            display_name: None,
            main_track: None,
            reminder_track: None,
            stopped: false,
            last_activity_at: now,
            form_state: None,
            entry_point: None,
            last_send: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn slot(&self, track: Track) -> Option<&TrackSlot> {
        match track {
            Track::Main => self.main_track.as_ref(),
            Track::Reminder => self.reminder_track.as_ref(),
        }
    }

    /// Replace whatever is pending on `track`. There is never more than one.
    pub fn set_slot(&mut self, track: Track, slot: TrackSlot) {
        match track {
            Track::Main => self.main_track = Some(slot),
            Track::Reminder => self.reminder_track = Some(slot),
        }
    }

    pub fn clear_slot(&mut self, track: Track) -> Option<TrackSlot> {
        match track {
            Track::Main => self.main_track.take(),
            Track::Reminder => self.reminder_track.take(),
        }
    }

    pub fn is_due(&self, track: Track, now: DateTime<Utc>) -> bool {
        !self.stopped && self.slot(track).is_some_and(|s| s.is_due(now))
    }

    pub fn has_pending(&self) -> bool {
        self.main_track.is_some() || self.reminder_track.is_some()
    }

    /// Freeze both tracks.
    pub fn stop(&mut self) {
        self.stopped = true;
        self.main_track = None;
        self.reminder_track = None;
    }

    /// Return to the "never entered the funnel" state. Delivery history stays.
    pub fn reset(&mut self) {
        self.main_track = None;
        self.reminder_track = None;
        self.form_state = None;
        self.stopped = false;
        self.entry_point = None;
    }

    /// Put `slot` on `track` unless the user is stopped or the track was
    /// rescheduled by someone else. Returns whether the slot was written.
    pub fn schedule_if_idle(&mut self, track: Track, slot: TrackSlot) -> bool {
        if self.stopped || self.slot(track).is_some() {
            return false;
        }
        self.set_slot(track, slot);
        true
    }

    /// Fold a send booked on `sent`, the copy taken before the gateway call,
    /// into this freshly read record. Only `last_send`, the stop flag and the
    /// sending track's slot are taken from `sent`; a stop or reschedule
    /// written meanwhile wins.
    pub fn absorb_send(&mut self, track: Track, sent: &ScheduleRecord) {
        self.last_send = sent.last_send.clone();
        if sent.stopped {
            self.stop();
            return;
        }
        if let Some(slot) = sent.slot(track) {
            self.schedule_if_idle(track, slot.clone());
        }
    }

    pub fn record_send(&mut self, message_id: &str, at: DateTime<Utc>, status: SendStatus) {
        self.last_send = Some(LastSend {
            message_id: message_id.to_string(),
            sent_at: at,
            status,
        });
    }

    /// Whether the last send ended in a terminal failure.
    pub fn is_halted(&self) -> bool {
        matches!(
            self.last_send.as_ref().map(|l| l.status),
            Some(SendStatus::FailedMaxRetries | SendStatus::Error)
        )
    }
}
