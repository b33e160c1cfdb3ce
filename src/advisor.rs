//! Advisory chat that sits beside the workflow. It shares the remote service
//! but never reads or writes workflow state, and a failed turn degrades to a
//! fixed apology instead of an error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::models::ChatTurn;
use crate::service::{GenerationService, ServiceError};

pub const GREETING: &str = "Hello! I'm your e-commerce visual consultant. How can I help?";
pub const FALLBACK_UNHEARD: &str = "Sorry, I didn't catch that.";
pub const FALLBACK_FAILURE: &str = "Sorry, something went wrong while reaching the assistant.";

#[derive(Debug, Error)]
pub enum AdvisorError {
    #[error("advisory session {0} not found")]
    UnknownSession(Uuid),
}

#[derive(Debug)]
struct AdvisorySession {
    /// Everything shown to the user, greeting and apologies included.
    transcript: Vec<ChatTurn>,
    /// Turns the model has actually seen and answered.
    context: Vec<ChatTurn>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvisoryTranscript {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub turns: Vec<ChatTurn>,
}

struct SessionSlot {
    session: Arc<Mutex<AdvisorySession>>,
    last_used: DateTime<Utc>,
    /// Ordering for least-recently-used eviction; timestamps can tie.
    touch: u64,
}

impl SessionSlot {
    /// A turn in flight holds a second handle.
    fn is_busy(&self) -> bool {
        Arc::strong_count(&self.session) > 1
    }
}

#[derive(Default)]
struct SessionTable {
    slots: HashMap<Uuid, SessionSlot>,
    clock: u64,
}

impl SessionTable {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

pub struct Advisor {
    service: Arc<dyn GenerationService>,
    sessions: RwLock<SessionTable>,
    idle_timeout: Duration,
    max_sessions: usize,
}

impl Advisor {
    #[cfg(test)]
    pub fn new(service: Arc<dyn GenerationService>) -> Self {
        Self::with_limits(service, Duration::from_secs(60 * 60), 256)
    }

    /// Sessions idle longer than `idle_timeout` are dropped, and at most
    /// `max_sessions` are kept, evicting the least recently used idle one.
    pub fn with_limits(service: Arc<dyn GenerationService>, idle_timeout: Duration, max_sessions: usize) -> Self {
        Self {
            service,
            sessions: RwLock::new(SessionTable::default()),
            idle_timeout,
            max_sessions: max_sessions.max(1),
        }
    }

    pub fn open_session(&self) -> AdvisoryTranscript {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let session = AdvisorySession {
            transcript: vec![ChatTurn::model(GREETING)],
            context: Vec::new(),
            created_at: now,
        };
        let transcript = AdvisoryTranscript { id, created_at: session.created_at, turns: session.transcript.clone() };

        let mut table = self.sessions.write();
        self.expire(&mut table, now);
        while table.slots.len() >= self.max_sessions {
            let oldest = table
                .slots
                .iter()
                .filter(|(_, slot)| !slot.is_busy())
                .min_by_key(|(_, slot)| slot.touch)
                .map(|(id, _)| *id);
            match oldest {
                Some(evicted) => {
                    table.slots.remove(&evicted);
                    info!(%evicted, "💬 Advisory session evicted, limit {} reached", self.max_sessions);
                }
                None => break,
            }
        }
        let touch = table.tick();
        table.slots.insert(id, SessionSlot { session: Arc::new(Mutex::new(session)), last_used: now, touch });
        drop(table);

        info!(%id, "💬 Advisory session opened");
        transcript
    }

    pub fn close_session(&self, id: Uuid) -> Result<(), AdvisorError> {
        self.sessions.write().slots.remove(&id).ok_or(AdvisorError::UnknownSession(id))?;
        info!(%id, "💬 Advisory session closed");
        Ok(())
    }

    /// Drops sessions idle for longer than the timeout as of `now`. Returns how many went.
    pub fn expire_idle(&self, now: DateTime<Utc>) -> usize {
        self.expire(&mut self.sessions.write(), now)
    }

    fn expire(&self, table: &mut SessionTable, now: DateTime<Utc>) -> usize {
        let before = table.slots.len();
        table.slots.retain(|id, slot| {
            let idle = (now - slot.last_used).to_std().map(|age| age > self.idle_timeout).unwrap_or(false);
            if idle && !slot.is_busy() {
                info!(%id, "💬 Advisory session expired");
                false
            } else {
                true
            }
        });
        before - table.slots.len()
    }

    fn session(&self, id: Uuid) -> Result<Arc<Mutex<AdvisorySession>>, AdvisorError> {
        let mut table = self.sessions.write();
        let touch = table.tick();
        let slot = table.slots.get_mut(&id).ok_or(AdvisorError::UnknownSession(id))?;
        slot.last_used = Utc::now();
        slot.touch = touch;
        Ok(slot.session.clone())
    }

    pub async fn transcript(&self, id: Uuid) -> Result<AdvisoryTranscript, AdvisorError> {
        let session = self.session(id)?;
        let session = session.lock().await;
        Ok(AdvisoryTranscript { id, created_at: session.created_at, turns: session.transcript.clone() })
    }

    /// Sends one user message and returns the reply. Blank input is ignored
    /// and yields `None`. Turns within one session run one at a time.
    pub async fn send_message(&self, id: Uuid, text: &str) -> Result<Option<String>, AdvisorError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        let session = self.session(id)?;
        let mut session = session.lock().await;
        session.transcript.push(ChatTurn::user(text));

        let outcome = self.service.converse(&session.context, text).await;
        let reply = match outcome {
            Ok(reply) if !reply.trim().is_empty() => {
                session.context.push(ChatTurn::user(text));
                session.context.push(ChatTurn::model(reply.clone()));
                reply
            }
            Ok(_) | Err(ServiceError::Empty(_)) => {
                warn!(%id, "⚠️ Advisor returned no text");
                FALLBACK_UNHEARD.to_string()
            }
            Err(e) => {
                error!(%id, "❌ Advisor call failed: {}", e);
                FALLBACK_FAILURE.to_string()
            }
        };
        session.transcript.push(ChatTurn::model(reply.clone()));
        Ok(Some(reply))
    }
}
