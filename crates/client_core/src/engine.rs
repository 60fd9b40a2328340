use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use shared::{
    domain::{Message, MessageId, Registrant},
    protocol::{MessageUpdate, RealtimeFrame, SendMessageRequest},
};
use tokio::{
    sync::{broadcast, Mutex, RwLock},
    task::JoinHandle,
};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::{
    error::SyncError,
    gateway::MessageGateway,
    link::{NullLink, RealtimeLink, WsLink},
    timeline::Timeline,
};

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    TimelineChanged(Vec<Message>),
    Notification(String),
    Error(String),
}

/// Keeps one client's timeline in step with the server and its peers.
pub struct SyncEngine {
    gateway: Arc<dyn MessageGateway>,
    link: RwLock<Arc<dyn RealtimeLink>>,
    timeline: Mutex<Timeline>,
    events: broadcast::Sender<ClientEvent>,
    welcomed: AtomicBool,
}

impl SyncEngine {
    pub fn new(gateway: Arc<dyn MessageGateway>) -> Arc<Self> {
        Self::with_timeline(gateway, Timeline::new())
    }

    pub fn with_timeline(gateway: Arc<dyn MessageGateway>, timeline: Timeline) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            gateway,
            link: RwLock::new(Arc::new(NullLink)),
            timeline: Mutex::new(timeline),
            events,
            welcomed: AtomicBool::new(false),
        })
    }

    pub async fn set_link(&self, link: Arc<dyn RealtimeLink>) {
        *self.link.write().await = link;
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> Vec<Message> {
        self.timeline.lock().await.messages().to_vec()
    }

    /// Replaces the timeline with the oldest window the retention bound allows.
    pub async fn initial_load(&self) -> Result<(), SyncError> {
        let capacity = self.timeline.lock().await.capacity() as u64;
        let messages = self
            .gateway
            .fetch_window(0, capacity)
            .await
            .map_err(|err| self.gateway_failure("initial load", err))?;

        let mut timeline = self.timeline.lock().await;
        timeline.replace(messages);
        self.emit_timeline(&timeline);
        Ok(())
    }

    pub async fn send(&self, author: &Registrant, body: &str) -> Result<Message, SyncError> {
        self.send_at(author, body, Utc::now()).await
    }

    /// Shows the message at once, then persists it. A failed persist leaves
    /// the unconfirmed entry visible.
    pub async fn send_at(
        &self,
        author: &Registrant,
        body: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Message, SyncError> {
        let draft = Message {
            id: None,
            sender_id: author.uid.clone(),
            display_name: author.display_name.clone(),
            avatar_ref: author.avatar_ref.clone(),
            timestamp,
            body: body.to_string(),
            show_avatar: None,
            show_timestamp: None,
        };
        let local = {
            let mut timeline = self.timeline.lock().await;
            let local = timeline.push_optimistic(draft);
            self.emit_timeline(&timeline);
            local
        };

        let message_id = match self.gateway.send(&SendMessageRequest::from(&local)).await {
            Ok(id) => id,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "send failed; keeping unconfirmed entry");
                return Err(self.gateway_failure("send", err));
            }
        };

        {
            let mut timeline = self.timeline.lock().await;
            timeline.confirm(&local.sender_id, local.timestamp, message_id);
            self.emit_timeline(&timeline);
        }

        let confirmed = Message {
            id: Some(message_id),
            ..local
        };
        self.publish(RealtimeFrame::Message {
            message: confirmed.clone(),
        })
        .await;
        Ok(confirmed)
    }

    /// Fetches the rank window around the local length and merges it.
    /// Failures leave the timeline unchanged.
    pub async fn catch_up(&self) -> Result<(), SyncError> {
        let (start, end) = self.timeline.lock().await.catch_up_window();
        let fetched = self
            .gateway
            .fetch_window(start, end)
            .await
            .map_err(|err| self.gateway_failure("catch-up", err))?;

        let mut timeline = self.timeline.lock().await;
        timeline.merge(fetched);
        self.emit_timeline(&timeline);
        Ok(())
    }

    /// Deletes locally with neighbor repair, then in the store, then tells
    /// peers.
    pub async fn delete(&self, message_id: MessageId) -> Result<(), SyncError> {
        let repair = {
            let mut timeline = self.timeline.lock().await;
            let repair = timeline
                .remove_with_repair(message_id)
                .ok_or(SyncError::UnknownMessage(message_id))?;
            self.emit_timeline(&timeline);
            repair
        };

        // A failed promotion leaves stale flags on the neighbor but must not
        // keep the message alive in the store.
        if let Some(promoted) = repair.promoted {
            match self.gateway.update(&promoted).await {
                Ok(()) => self.publish(RealtimeFrame::Update(promoted)).await,
                Err(err) => {
                    self.gateway_failure("promote after delete", err);
                }
            }
        }

        self.gateway
            .delete(message_id)
            .await
            .map_err(|err| self.gateway_failure("delete", err))?;
        self.publish(RealtimeFrame::Delete { message_id }).await;
        Ok(())
    }

    /// Edits a message body, keeping its current grouping flags.
    pub async fn update(&self, message_id: MessageId, body: &str) -> Result<(), SyncError> {
        let update = {
            let mut timeline = self.timeline.lock().await;
            let current = timeline
                .find(message_id)
                .ok_or(SyncError::UnknownMessage(message_id))?;
            let update = MessageUpdate {
                message_id,
                body: body.to_string(),
                show_avatar: current.show_avatar.unwrap_or(true),
                show_timestamp: current.show_timestamp.unwrap_or(false),
            };
            timeline.apply_update(&update);
            self.emit_timeline(&timeline);
            update
        };

        self.gateway
            .update(&update)
            .await
            .map_err(|err| self.gateway_failure("update", err))?;
        self.publish(RealtimeFrame::Update(update)).await;
        Ok(())
    }

    pub async fn handle_frame(&self, frame: RealtimeFrame) {
        match frame {
            RealtimeFrame::Notification { welcome, message } => {
                if welcome && self.welcomed.swap(true, Ordering::SeqCst) {
                    debug!("suppressing repeated welcome");
                    return;
                }
                let _ = self.events.send(ClientEvent::Notification(message));
            }
            RealtimeFrame::Message { message } => {
                debug!(message_id = ?message.id, "peer created a message; catching up");
                // The error is already reported as an event.
                let _ = self.catch_up().await;
            }
            RealtimeFrame::Delete { message_id } => {
                let mut timeline = self.timeline.lock().await;
                if timeline.remove(message_id).is_some() {
                    self.emit_timeline(&timeline);
                }
            }
            RealtimeFrame::Update(update) => {
                let mut timeline = self.timeline.lock().await;
                if timeline.apply_update(&update) {
                    self.emit_timeline(&timeline);
                }
            }
            RealtimeFrame::Register { user } => {
                debug!(uid = user.uid.as_str(), "peer registered");
            }
        }
    }

    pub async fn handle_text(&self, raw: &str) {
        match serde_json::from_str::<RealtimeFrame>(raw) {
            Ok(frame) => self.handle_frame(frame).await,
            Err(err) => {
                warn!(error = %err, "ignoring malformed realtime frame");
                let _ = self
                    .events
                    .send(ClientEvent::Error(format!("invalid realtime frame: {err}")));
            }
        }
    }

    async fn publish(&self, frame: RealtimeFrame) {
        let link = Arc::clone(&*self.link.read().await);
        let kind = frame.kind();
        if let Err(err) = link.publish(frame).await {
            warn!(kind, error = %format!("{err:#}"), "failed to publish realtime frame");
            let _ = self
                .events
                .send(ClientEvent::Error(SyncError::Link(err).to_string()));
        }
    }

    fn gateway_failure(&self, operation: &str, err: anyhow::Error) -> SyncError {
        warn!(operation, error = %format!("{err:#}"), "message gateway call failed");
        let err = SyncError::Gateway(err);
        let _ = self.events.send(ClientEvent::Error(format!("{operation}: {err}")));
        err
    }

    fn emit_timeline(&self, timeline: &Timeline) {
        let _ = self
            .events
            .send(ClientEvent::TimelineChanged(timeline.messages().to_vec()));
    }
}

/// Opens the realtime socket, announces `registrant`, and feeds inbound
/// frames to `engine` until the server hangs up.
pub async fn connect_realtime(
    engine: Arc<SyncEngine>,
    server_url: &str,
    registrant: Registrant,
) -> Result<JoinHandle<()>, SyncError> {
    let (link, mut reader) = WsLink::connect(server_url).await?;
    link.publish(RealtimeFrame::Register { user: registrant })
        .await
        .map_err(SyncError::Link)?;
    engine.set_link(Arc::new(link)).await;

    Ok(tokio::spawn(async move {
        while let Some(msg) = reader.next().await {
            match msg {
                Ok(WsMessage::Text(text)) => engine.handle_text(&text).await,
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    let _ = engine
                        .events
                        .send(ClientEvent::Error(format!("realtime connection failed: {err}")));
                    break;
                }
            }
        }
        engine.set_link(Arc::new(NullLink)).await;
        info!("realtime connection ended");
    }))
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
