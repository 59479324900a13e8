//! Resilient messaging utilities with automatic retry for Telegram API operations.
//!
//! These wrappers retry transient network failures using exponential backoff
//! with jitter.
//!
//! # Usage
//!
//! ```ignore
//! use blacksky_gateway::bot::resilient::{send_media_resilient, send_message_resilient};
//!
//! send_message_resilient(&bot, chat_id, "Hello!", Some(ParseMode::Html)).await?;
//! send_media_resilient(&bot, chat_id, &delivery).await?;
//! ```

use crate::gateway::validator::MediaKind;
use crate::gateway::DeliveryInstruction;
use anyhow::{Context, Result};
use teloxide::prelude::*;
use teloxide::types::{ChatId, InputFile, Message, ParseMode};
use tracing::debug;

/// Telegram caption limit
pub const TELEGRAM_CAPTION_LIMIT: usize = 1024;

/// Send a message with automatic retry on network failures.
///
/// Uses [`crate::utils::retry_telegram_operation`] with exponential backoff
/// to handle transient network errors.
///
/// # Errors
///
/// Returns an error after all retries are exhausted.
pub async fn send_message_resilient(
    bot: &Bot,
    chat_id: ChatId,
    text: impl Into<String>,
    parse_mode: Option<ParseMode>,
) -> Result<Message> {
    let text = text.into();
    crate::utils::retry_telegram_operation(|| async {
        let mut req = bot.send_message(chat_id, text.clone());
        if let Some(pm) = parse_mode {
            req = req.parse_mode(pm);
        }
        req.await
            .map_err(|e| anyhow::anyhow!("Telegram send error: {e}"))
    })
    .await
}

/// Deliver a fetched resource by URL, as an animation or a photo depending
/// on the category's media kind.
///
/// # Errors
///
/// Returns an error if the locator is not a valid URL or all retries fail.
pub async fn send_media_resilient(
    bot: &Bot,
    chat_id: ChatId,
    delivery: &DeliveryInstruction,
) -> Result<Message> {
    let url = reqwest::Url::parse(&delivery.url)
        .with_context(|| format!("Invalid media locator: {}", delivery.url))?;
    let caption = crate::utils::truncate_str(&delivery.caption, TELEGRAM_CAPTION_LIMIT);
    let as_animation = sends_as_animation(delivery.kind);
    debug!(
        chat_id = chat_id.0,
        url = %url,
        as_animation,
        "Sending media"
    );

    crate::utils::retry_telegram_operation(|| async {
        let file = InputFile::url(url.clone());
        let sent = if as_animation {
            bot.send_animation(chat_id, file)
                .caption(caption.clone())
                .await
        } else {
            bot.send_photo(chat_id, file).caption(caption.clone()).await
        };
        sent.map_err(|e| anyhow::anyhow!("Telegram media error: {e}"))
    })
    .await
}

/// Animated categories go out as animations, everything else as photos
#[must_use]
pub const fn sends_as_animation(kind: MediaKind) -> bool {
    matches!(kind, MediaKind::Animated)
}
