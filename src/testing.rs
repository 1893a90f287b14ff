//! Shared fakes for the delivery-path tests.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::Config;
use crate::functions::deliver::DeliveryExecutor;
use crate::functions::serializer::ChannelSerializer;
use crate::schema::{Contact, ScheduledMessage, Ticket};
use crate::services::{
    DeliveryReceipt, MemoryScheduleStore, MessageTransport, RecordingNotifier, ScheduleStore,
    TicketResolver,
};

#[derive(Debug, Clone)]
pub struct SendRecord {
    pub address: String,
    pub body: String,
    pub started: Instant,
    pub finished: Instant,
}

/// Transport double: records every send, optionally holds the channel
/// for a while, optionally fails, and answers group lookups from a
/// preset value.
#[derive(Default)]
pub struct FakeTransport {
    sends: Mutex<Vec<SendRecord>>,
    fail_sends: AtomicBool,
    delay: Mutex<Duration>,
    group_address: Mutex<Option<String>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_sends.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn set_group_address(&self, address: &str) {
        *self.group_address.lock().unwrap() = Some(address.to_string());
    }

    pub fn sends(&self) -> Vec<SendRecord> {
        self.sends.lock().unwrap().clone()
    }

    pub fn send_count(&self) -> usize {
        self.sends.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl MessageTransport for FakeTransport {
    async fn send(&self, address: &str, body: &str) -> anyhow::Result<DeliveryReceipt> {
        let started = Instant::now();
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            anyhow::bail!("connection closed");
        }
        self.sends.lock().unwrap().push(SendRecord {
            address: address.to_string(),
            body: body.to_string(),
            started,
            finished: Instant::now(),
        });
        Ok(DeliveryReceipt {
            external_id: format!("out_{}", Uuid::new_v4().as_simple()),
        })
    }

    async fn find_group_by_subject(&self, _subject: &str) -> anyhow::Result<Option<String>> {
        Ok(self.group_address.lock().unwrap().clone())
    }
}

pub struct StubTicketResolver {
    pub ticket_id: Uuid,
    fail: AtomicBool,
}

impl StubTicketResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ticket_id: Uuid::new_v4(),
            fail: AtomicBool::new(false),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl TicketResolver for StubTicketResolver {
    async fn find_or_create(&self, contact: &Contact) -> anyhow::Result<Ticket> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("ticket service unavailable");
        }
        let now = Utc::now();
        Ok(Ticket {
            id: self.ticket_id,
            contact_id: contact.id,
            channel_id: contact.channel_id,
            company_id: contact.company_id,
            status: "open".to_string(),
            created_at: now,
            updated_at: now,
        })
    }
}

/// Config with millisecond-scale timers so timer-path tests finish fast.
pub fn test_config() -> Config {
    Config {
        send_timeout: Duration::from_millis(500),
        fallback_grace: Duration::from_millis(10),
        fallback_jitter_mod_ms: 1,
        backoff_base_secs: 2,
        ..Config::default()
    }
}

pub struct Harness {
    pub config: Arc<Config>,
    pub store: Arc<MemoryScheduleStore>,
    pub transport: Arc<FakeTransport>,
    pub tickets: Arc<StubTicketResolver>,
    pub notifier: Arc<RecordingNotifier>,
    pub executor: Arc<DeliveryExecutor>,
    pub company_id: Uuid,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        let config = Arc::new(config);
        let store = Arc::new(MemoryScheduleStore::new());
        let transport = FakeTransport::new();
        let tickets = StubTicketResolver::new();
        let notifier = Arc::new(RecordingNotifier::new());
        let executor = Arc::new(DeliveryExecutor::new(
            config.clone(),
            store.clone(),
            transport.clone(),
            tickets.clone(),
            notifier.clone(),
            ChannelSerializer::new(),
        ));
        Self {
            config,
            store,
            transport,
            tickets,
            notifier,
            executor,
            company_id: Uuid::new_v4(),
        }
    }

    pub fn add_contact(&self, is_group: bool) -> Contact {
        let now = Utc::now();
        let contact = Contact {
            id: Uuid::new_v4(),
            name: "Ada Lovelace".to_string(),
            number: "5511999990000".to_string(),
            remote_address: if is_group {
                None
            } else {
                Some("5511999990000@s.whatsapp.net".to_string())
            },
            is_group,
            channel_id: Uuid::new_v4(),
            company_id: self.company_id,
            created_at: now,
            updated_at: now,
        };
        self.store.add_contact(contact.clone());
        contact
    }

    pub async fn add_schedule(
        &self,
        contact: &Contact,
        send_at: DateTime<Utc>,
    ) -> ScheduledMessage {
        let schedule = ScheduledMessage::new(
            "scheduled follow-up".to_string(),
            send_at,
            contact.id,
            self.company_id,
            None,
        );
        self.store.insert(&schedule).await.unwrap();
        schedule
    }

    pub async fn schedule_status(&self, id: Uuid) -> ScheduledMessage {
        self.store.get(id, self.company_id).await.unwrap().unwrap()
    }

    pub fn published_actions(&self) -> Vec<String> {
        self.notifier
            .published()
            .into_iter()
            .map(|(action, _)| action)
            .collect()
    }
}
