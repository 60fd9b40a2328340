use shared::domain::MessageId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("message gateway request failed: {0:#}")]
    Gateway(anyhow::Error),
    #[error("realtime link failed: {0:#}")]
    Link(anyhow::Error),
    #[error("message {0} is not in the local timeline")]
    UnknownMessage(MessageId),
    #[error("server url must start with http:// or https://, got {0:?}")]
    InvalidServerUrl(String),
}
