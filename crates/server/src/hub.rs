//! Realtime fanout: relays client events to every other live session.

use std::collections::HashMap;

use shared::{
    domain::{Message, MessageId, Registrant, SessionId},
    error::ErrorCode,
    protocol::{InboundEvent, MessageUpdate, RealtimeFrame},
};
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    RwLock,
};
use tracing::{debug, info, warn};

pub const WELCOME_TEXT: &str = "Welcome to the chat!";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Registered,
    Closed,
}

struct SessionHandle {
    state: SessionState,
    registrant: Option<Registrant>,
    tx: mpsc::Sender<RealtimeFrame>,
}

pub struct FanoutHub {
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
    buffer: usize,
}

impl FanoutHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            buffer: buffer.max(1),
        }
    }

    /// Opens a session and queues the welcome notification as its first frame.
    pub async fn connect(&self) -> (SessionId, mpsc::Receiver<RealtimeFrame>) {
        let session = SessionId::new();
        let (tx, rx) = mpsc::channel(self.buffer);
        // The receiver is fresh, so the first frame always fits.
        let _ = tx.try_send(RealtimeFrame::welcome(WELCOME_TEXT));
        self.sessions.write().await.insert(
            session,
            SessionHandle {
                state: SessionState::Connected,
                registrant: None,
                tx,
            },
        );
        info!(session = %session, "realtime session connected");
        (session, rx)
    }

    /// Returns false when the session is already closed.
    pub async fn register(&self, session: SessionId, registrant: Registrant) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(handle) = sessions.get_mut(&session) else {
            return false;
        };
        info!(
            session = %session,
            uid = registrant.uid.as_str(),
            display_name = %registrant.display_name,
            "user registered"
        );
        handle.state = SessionState::Registered;
        handle.registrant = Some(registrant);
        true
    }

    pub async fn close(&self, session: SessionId) {
        if let Some(handle) = self.sessions.write().await.remove(&session) {
            let uid = handle
                .registrant
                .as_ref()
                .map(|r| r.uid.as_str().to_owned())
                .unwrap_or_default();
            info!(session = %session, uid, "realtime session closed");
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn session_state(&self, session: SessionId) -> SessionState {
        self.sessions
            .read()
            .await
            .get(&session)
            .map(|handle| handle.state)
            .unwrap_or(SessionState::Closed)
    }

    pub async fn broadcast_create(&self, message: Message, exclude: Option<SessionId>) -> usize {
        self.broadcast(RealtimeFrame::Message { message }, exclude)
            .await
    }

    pub async fn broadcast_update(&self, update: MessageUpdate, exclude: Option<SessionId>) -> usize {
        self.broadcast(RealtimeFrame::Update(update), exclude).await
    }

    pub async fn broadcast_delete(&self, message_id: MessageId, exclude: Option<SessionId>) -> usize {
        self.broadcast(RealtimeFrame::Delete { message_id }, exclude)
            .await
    }

    /// Queues `frame` on every live session except `exclude` and returns how
    /// many sessions accepted it. A full buffer drops the frame for that
    /// session only; a dropped receiver closes the session.
    pub async fn broadcast(&self, frame: RealtimeFrame, exclude: Option<SessionId>) -> usize {
        let mut delivered = 0;
        let mut gone = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for (id, handle) in sessions.iter() {
                if Some(*id) == exclude {
                    continue;
                }
                match handle.tx.try_send(frame.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!(session = %id, kind = frame.kind(), "session buffer full; frame dropped")
                    }
                    Err(TrySendError::Closed(_)) => gone.push(*id),
                }
            }
        }

        if !gone.is_empty() {
            let mut sessions = self.sessions.write().await;
            for id in gone {
                sessions.remove(&id);
                debug!(session = %id, "dropped session with closed receiver");
            }
        }
        delivered
    }

    /// Parses one client frame and relays it. Malformed frames are logged and
    /// ignored; the connection stays open.
    pub async fn handle_inbound(&self, session: SessionId, raw: &str) {
        if self.session_state(session).await == SessionState::Closed {
            debug!(session = %session, "frame from closed session ignored");
            return;
        }
        match InboundEvent::parse(raw) {
            InboundEvent::Register(registrant) => {
                if self.register(session, registrant.clone()).await {
                    self.broadcast(RealtimeFrame::Register { user: registrant }, Some(session))
                        .await;
                }
            }
            InboundEvent::Create(message) => {
                self.broadcast_create(message, Some(session)).await;
            }
            InboundEvent::Delete(message_id) => {
                self.broadcast_delete(message_id, Some(session)).await;
            }
            InboundEvent::Update(update) => {
                self.broadcast_update(update, Some(session)).await;
            }
            InboundEvent::Malformed(reason) => {
                warn!(
                    session = %session,
                    code = ?ErrorCode::MalformedEvent,
                    %reason,
                    "ignoring malformed realtime frame"
                );
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/hub_tests.rs"]
mod tests;
