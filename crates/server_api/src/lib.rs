use std::sync::Arc;

use chrono::{TimeZone, Utc};
use range_cache::{RangeCache, WindowKey};
use shared::{
    domain::{Message, MessageId},
    error::{ApiError, ErrorCode},
    protocol::{MessageUpdate, SendMessageRequest},
};
use storage::{NewMessage, RemoveOutcome, Storage, StoreError, StoredMessage};
use tracing::{debug, info};

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub cache: Arc<dyn RangeCache>,
}

/// Validates raw textual window bounds into a rank window.
pub fn parse_window(start: Option<&str>, end: Option<&str>) -> Result<WindowKey, ApiError> {
    let (Some(start), Some(end)) = (start, end) else {
        return Err(ApiError::invalid_range(
            "missing \"start\" or \"end\" parameter",
        ));
    };
    let start = parse_bound("start", start)?;
    let end = parse_bound("end", end)?;
    if start > end {
        return Err(ApiError::invalid_range(format!(
            "start ({start}) must not exceed end ({end})"
        )));
    }
    Ok(WindowKey::new(start, end))
}

fn parse_bound(name: &str, raw: &str) -> Result<u64, ApiError> {
    raw.trim().parse::<u64>().map_err(|_| {
        ApiError::invalid_range(format!(
            "\"{name}\" must be a non-negative integer, got {raw:?}"
        ))
    })
}

/// Returns the `start`-th through `end`-th oldest messages with grouping left
/// for the caller to derive.
pub async fn get_messages(ctx: &ApiContext, window: WindowKey) -> Result<Vec<Message>, ApiError> {
    if window.start > window.end {
        return Err(ApiError::invalid_range(format!(
            "start ({}) must not exceed end ({})",
            window.start, window.end
        )));
    }

    if let Some(cached) = ctx.cache.get(window).await.map_err(internal)? {
        return Ok(cached);
    }

    // Counting first means appends racing the read can only make the window
    // look closer to the tail, never further from it.
    let total = ctx.storage.count().await.map_err(store_error)?;
    let rows = ctx
        .storage
        .read_range(window.start, window.end)
        .await
        .map_err(store_error)?;
    let messages = rows
        .into_iter()
        .map(normalize)
        .collect::<Result<Vec<_>, _>>()?;

    if window.is_below_tail(total) && messages.len() as u64 == window.span() {
        ctx.cache
            .put(window, messages.clone())
            .await
            .map_err(internal)?;
        debug!(start = window.start, end = window.end, total, "cached history window");
    }

    Ok(messages)
}

pub async fn send_message(
    ctx: &ApiContext,
    request: SendMessageRequest,
) -> Result<MessageId, ApiError> {
    let message_id = ctx
        .storage
        .append(&NewMessage {
            sender_id: request.sender_id,
            display_name: request.display_name,
            avatar_ref: request.avatar_ref,
            timestamp: request.timestamp,
            body: request.body,
            show_avatar: request.show_avatar,
            show_timestamp: request.show_timestamp,
        })
        .await
        .map_err(store_error)?;
    info!(message_id = message_id.0, "message saved");
    Ok(message_id)
}

/// Deletes a message. Deleting one that is already gone succeeds so that a
/// duplicated delete event does not surface as an error.
pub async fn delete_message(
    ctx: &ApiContext,
    message_id: Option<MessageId>,
) -> Result<(), ApiError> {
    let message_id =
        message_id.ok_or_else(|| ApiError::validation("missing \"message_id\" parameter"))?;
    match ctx.storage.remove(message_id).await.map_err(store_error)? {
        RemoveOutcome::Removed => info!(message_id = message_id.0, "message deleted"),
        RemoveOutcome::AlreadyRemoved => {
            debug!(message_id = message_id.0, "message already deleted")
        }
    }
    Ok(())
}

pub async fn update_message(ctx: &ApiContext, update: MessageUpdate) -> Result<(), ApiError> {
    if update.body.is_empty() {
        return Err(ApiError::validation("missing \"message\" parameter"));
    }
    ctx.storage
        .update_with_grouping(
            update.message_id,
            &update.body,
            update.show_avatar,
            update.show_timestamp,
        )
        .await
        .map_err(store_error)?;
    info!(message_id = update.message_id.0, "message updated");
    Ok(())
}

pub async fn health(ctx: &ApiContext) -> Result<(), ApiError> {
    ctx.storage.health_check().await.map_err(store_error)
}

fn normalize(row: StoredMessage) -> Result<Message, ApiError> {
    let timestamp = Utc
        .timestamp_millis_opt(row.created_at_ms)
        .single()
        .ok_or_else(|| {
            ApiError::new(
                ErrorCode::Internal,
                format!(
                    "message {} has an invalid timestamp {}",
                    row.message_id, row.created_at_ms
                ),
            )
        })?;
    Ok(Message {
        id: Some(row.message_id),
        sender_id: row.sender_id,
        display_name: row.display_name,
        avatar_ref: row.avatar_ref,
        timestamp,
        body: row.body,
        show_avatar: None,
        show_timestamp: None,
    })
}

fn store_error(err: anyhow::Error) -> ApiError {
    match err.downcast_ref::<StoreError>() {
        Some(StoreError::NotFound(_)) => ApiError::not_found(err.to_string()),
        Some(StoreError::Unavailable(_)) => {
            ApiError::new(ErrorCode::StoreUnavailable, format!("{err:#}"))
        }
        None => internal(err),
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, format!("{err:#}"))
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
