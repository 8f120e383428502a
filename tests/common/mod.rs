//! Stub collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use funnel_dispatch::config::{DispatcherConfig, ReclaimerConfig};
use funnel_dispatch::error::{DatabaseError, DeliveryError};
use funnel_dispatch::funnel::{
    Courier, Dispatcher, FunnelGraph, InactivityReclaimer, RetryPolicy, ScheduleRecord,
    TrackController,
};
use funnel_dispatch::gateway::{DeliveryReceipt, MessageGateway, MessageRenderer, RenderedMessage};
use funnel_dispatch::store::{LibSqlBackend, ScheduleStore};

/// A store write the conversation layer makes while a send is in flight.
pub struct MidSendWrite {
    store: Arc<dyn ScheduleStore>,
    user_id: String,
    edit: Box<dyn FnOnce(&mut ScheduleRecord) + Send>,
}

/// Gateway that logs every send and replays scripted failures.
///
/// Destinations in `blocked` always fail permanently. Otherwise the next
/// scripted result is used, and once the script runs dry every send succeeds
/// unless `always_fail` is set. A queued `MidSendWrite` runs once, inside the
/// next send.
#[derive(Default)]
pub struct StubGateway {
    pub sent: Mutex<Vec<(String, String)>>,
    script: Mutex<VecDeque<Result<(), DeliveryError>>>,
    blocked: Mutex<HashSet<String>>,
    always_fail: Mutex<bool>,
    mid_send: Mutex<Option<MidSendWrite>>,
}

impl StubGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_failure(&self, err: DeliveryError) {
        self.script.lock().unwrap().push_back(Err(err));
    }

    pub fn push_ok(&self) {
        self.script.lock().unwrap().push_back(Ok(()));
    }

    pub fn block(&self, destination: &str) {
        self.blocked.lock().unwrap().insert(destination.to_string());
    }

    pub fn fail_everything(&self) {
        *self.always_fail.lock().unwrap() = true;
    }

    /// Message ids sent so far, in order.
    pub fn sent_ids(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, text)| text.clone()).collect()
    }

    pub fn sent_to(&self, destination: &str) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(dest, _)| dest == destination)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl MessageGateway for StubGateway {
    fn name(&self) -> &str {
        "stub"
    }

    async fn send(
        &self,
        destination: &str,
        message: &RenderedMessage,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        self.sent
            .lock()
            .unwrap()
            .push((destination.to_string(), message.text.clone()));

        let write = self.mid_send.lock().unwrap().take();
        if let Some(write) = write {
            let mut record = write.store.get_record(&write.user_id).await.unwrap().unwrap();
            (write.edit)(&mut record);
            write.store.put_record(&record).await.unwrap();
        }

        if self.blocked.lock().unwrap().contains(destination) {
            return Err(DeliveryError::permanent("stub", "bot was blocked by the user"));
        }
        let scripted = self.script.lock().unwrap().pop_front();
        match scripted {
            Some(Err(e)) => Err(e),
            _ if *self.always_fail.lock().unwrap() => {
                Err(DeliveryError::transient("stub", "connection reset"))
            }
            _ => Ok(DeliveryReceipt {
                gateway_message_id: Some("1".into()),
                delivered_at: Utc::now(),
            }),
        }
    }
}

/// Renders a message as its own id. Ids starting with `missing` have no content.
pub struct EchoRenderer;

impl MessageRenderer for EchoRenderer {
    fn render(&self, message_id: &str, _recipient_name: Option<&str>) -> Option<RenderedMessage> {
        (!message_id.starts_with("missing")).then(|| RenderedMessage::text(message_id))
    }
}

/// libSQL store whose writes fail for selected users.
pub struct FlakyStore {
    inner: LibSqlBackend,
    broken: Mutex<HashSet<String>>,
}

impl FlakyStore {
    pub async fn new() -> Self {
        Self {
            inner: LibSqlBackend::new_memory().await.unwrap(),
            broken: Mutex::new(HashSet::new()),
        }
    }

    pub fn break_writes_for(&self, user_id: &str) {
        self.broken.lock().unwrap().insert(user_id.to_string());
    }

    /// Seed a record, bypassing the failure injection.
    pub async fn seed(&self, record: &ScheduleRecord) {
        self.inner.put_record(record).await.unwrap();
    }
}

#[async_trait]
impl ScheduleStore for FlakyStore {
    async fn get_record(&self, user_id: &str) -> Result<Option<ScheduleRecord>, DatabaseError> {
        self.inner.get_record(user_id).await
    }

    async fn put_record(&self, record: &ScheduleRecord) -> Result<(), DatabaseError> {
        if self.broken.lock().unwrap().contains(&record.user_id) {
            return Err(DatabaseError::Query("disk I/O error".into()));
        }
        self.inner.put_record(record).await
    }

    async fn list_records(&self) -> Result<Vec<ScheduleRecord>, DatabaseError> {
        self.inner.list_records().await
    }

    async fn list_failed(&self) -> Result<Vec<ScheduleRecord>, DatabaseError> {
        self.inner.list_failed().await
    }
}

/// Everything a test needs, wired against one store and one stub gateway.
pub struct Harness {
    pub store: Arc<dyn ScheduleStore>,
    pub gateway: Arc<StubGateway>,
    pub dispatcher: Dispatcher,
    pub controller: TrackController,
    pub reclaimer: Arc<InactivityReclaimer>,
}

impl Harness {
    pub async fn new(graph: FunnelGraph) -> Self {
        let store: Arc<dyn ScheduleStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        Self::with_store(graph, store)
    }

    pub fn with_store(graph: FunnelGraph, store: Arc<dyn ScheduleStore>) -> Self {
        let gateway = StubGateway::new();
        let graph = Arc::new(graph);
        let courier = Arc::new(Courier::new(
            gateway.clone(),
            Arc::new(EchoRenderer),
            RetryPolicy::default(),
            Duration::from_secs(1),
        ));
        let reclaimer = Arc::new(InactivityReclaimer::new(
            Arc::clone(&store),
            &ReclaimerConfig::default(),
        ));
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&graph),
            Arc::clone(&courier),
            &DispatcherConfig::default(),
        );
        let controller = TrackController::new(
            Arc::clone(&store),
            graph,
            courier,
            Arc::clone(&reclaimer),
        );
        Self {
            store,
            gateway,
            dispatcher,
            controller,
            reclaimer,
        }
    }

    pub async fn record(&self, user_id: &str) -> ScheduleRecord {
        self.store.get_record(user_id).await.unwrap().unwrap()
    }

    pub async fn put(&self, record: &ScheduleRecord) {
        self.store.put_record(record).await.unwrap();
    }

    /// Edit `user_id`'s stored record from inside the next gateway send.
    pub fn on_send(&self, user_id: &str, edit: impl FnOnce(&mut ScheduleRecord) + Send + 'static) {
        *self.gateway.mid_send.lock().unwrap() = Some(MidSendWrite {
            store: Arc::clone(&self.store),
            user_id: user_id.to_string(),
            edit: Box::new(edit),
        });
    }
}
