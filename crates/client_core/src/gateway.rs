use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use shared::{
    domain::{Message, MessageId},
    error::{ApiException, ErrorCode},
    protocol::{
        DeleteMessageRequest, MessageUpdate, MessagesResponse, SendMessageRequest,
        SendMessageResponse,
    },
};

/// Client view of the pagination gateway.
#[async_trait]
pub trait MessageGateway: Send + Sync {
    async fn fetch_window(&self, start: u64, end: u64) -> Result<Vec<Message>>;
    async fn send(&self, request: &SendMessageRequest) -> Result<MessageId>;
    async fn delete(&self, message_id: MessageId) -> Result<()>;
    async fn update(&self, update: &MessageUpdate) -> Result<()>;
}

pub struct HttpGateway {
    http: Client,
    server_url: String,
}

impl HttpGateway {
    pub fn new(server_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            server_url: server_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

#[async_trait]
impl MessageGateway for HttpGateway {
    async fn fetch_window(&self, start: u64, end: u64) -> Result<Vec<Message>> {
        let res = self
            .http
            .get(format!("{}/get-messages", self.server_url))
            .query(&[("start", start), ("end", end)])
            .send()
            .await
            .with_context(|| format!("failed to fetch messages {start}..={end}"))?;
        let body: MessagesResponse = check(res).await?.json().await?;
        Ok(body.messages)
    }

    async fn send(&self, request: &SendMessageRequest) -> Result<MessageId> {
        let res = self
            .http
            .post(format!("{}/send-message", self.server_url))
            .json(request)
            .send()
            .await
            .context("failed to send message")?;
        let body: SendMessageResponse = check(res).await?.json().await?;
        Ok(body.message_id)
    }

    async fn delete(&self, message_id: MessageId) -> Result<()> {
        let res = self
            .http
            .post(format!("{}/delete-message", self.server_url))
            .json(&DeleteMessageRequest {
                message_id: Some(message_id),
            })
            .send()
            .await
            .with_context(|| format!("failed to delete message {message_id}"))?;
        check(res).await?;
        Ok(())
    }

    async fn update(&self, update: &MessageUpdate) -> Result<()> {
        let res = self
            .http
            .post(format!("{}/update-message", self.server_url))
            .json(update)
            .send()
            .await
            .with_context(|| format!("failed to update message {}", update.message_id))?;
        check(res).await?;
        Ok(())
    }
}

/// The server answers every failure with a 500 and the error text as the
/// body, so the status carries no error class.
async fn check(res: Response) -> Result<Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let text = res.text().await.unwrap_or_default();
    Err(ApiException::new(ErrorCode::Internal, format!("{status}: {text}")).into())
}

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod tests;
