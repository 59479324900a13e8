//! Telegram command handlers for the content gateway.
//!
//! Every handler resolves the sender and conversation from the message and
//! delegates to [`GatewayOrchestrator`]; the handlers only translate results
//! into replies.

use crate::bot::resilient::{send_media_resilient, send_message_resilient};
use crate::gateway::catalog::SourceCatalog;
use crate::gateway::policy::PolicyError;
use crate::gateway::{GatewayOrchestrator, GatewayStats};
use anyhow::Result;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use teloxide::utils::command::BotCommands;
use tracing::{info, warn};

/// Supported bot commands
#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "lowercase", description = "Available commands:")]
pub enum Command {
    /// Welcome message
    #[command(description = "show the welcome message")]
    Start,
    /// Command list
    #[command(description = "show this help")]
    Help,
    /// Age assertion
    #[command(description = "confirm your age: /verify <age>")]
    Verify(String),
    /// Content request
    #[command(description = "get something: /fetch <category>")]
    Fetch(String),
    /// Per-chat switch
    #[command(description = "turn media on or off in this chat: /toggle on|off")]
    Toggle(String),
    /// Gateway counters
    #[command(description = "show gateway statistics")]
    Stats,
    /// Configured categories
    #[command(description = "list available categories")]
    Categories,
}

/// Reply for messages without a user sender, such as channel posts
const NO_SENDER_REPLY: &str = "⚠️ This command needs a user account. Send it from your own profile.";

/// Sender id; `None` for channel posts and anonymous admins
#[must_use]
pub fn sender_id(msg: &Message) -> Option<i64> {
    msg.from
        .as_ref()
        .filter(|user| !user.is_anonymous() && !user.is_channel())
        .map(|user| user.id.0.cast_signed())
}

/// Conversation key used for group settings
#[must_use]
pub fn conversation_id(msg: &Message) -> String {
    msg.chat.id.0.to_string()
}

/// Parse the `/verify` argument
#[must_use]
pub fn parse_age(arg: &str) -> Option<u32> {
    arg.trim().parse().ok()
}

/// Parse the `/toggle` argument
#[must_use]
pub fn parse_toggle(arg: &str) -> Option<bool> {
    match arg.trim().to_ascii_lowercase().as_str() {
        "on" | "enable" | "enabled" | "1" => Some(true),
        "off" | "disable" | "disabled" | "0" => Some(false),
        _ => None,
    }
}

/// Run a parsed command
///
/// # Errors
///
/// Returns an error if a reply cannot be sent.
pub async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    gateway: Arc<GatewayOrchestrator>,
) -> Result<()> {
    match cmd {
        Command::Start => start(&bot, &msg, &gateway).await,
        Command::Help => help(&bot, &msg).await,
        Command::Verify(arg) => verify(&bot, &msg, &gateway, &arg).await,
        Command::Fetch(arg) => fetch(&bot, &msg, &gateway, &arg).await,
        Command::Toggle(arg) => toggle(&bot, &msg, &gateway, &arg).await,
        Command::Stats => stats(&bot, &msg, &gateway).await,
        Command::Categories => categories(&bot, &msg, &gateway).await,
    }
}

async fn start(bot: &Bot, msg: &Message, gateway: &GatewayOrchestrator) -> Result<()> {
    let text = format!(
        "👋 <b>Hi!</b>\n\nVerify your age with /verify &lt;age&gt;, then ask for something with /fetch &lt;category&gt;.\n\n{}",
        format_categories(gateway.catalog())
    );
    send_message_resilient(bot, msg.chat.id, text, Some(ParseMode::Html)).await?;
    Ok(())
}

async fn help(bot: &Bot, msg: &Message) -> Result<()> {
    send_message_resilient(bot, msg.chat.id, Command::descriptions().to_string(), None).await?;
    Ok(())
}

async fn categories(bot: &Bot, msg: &Message, gateway: &GatewayOrchestrator) -> Result<()> {
    send_message_resilient(
        bot,
        msg.chat.id,
        format_categories(gateway.catalog()),
        Some(ParseMode::Html),
    )
    .await?;
    Ok(())
}

async fn verify(bot: &Bot, msg: &Message, gateway: &GatewayOrchestrator, arg: &str) -> Result<()> {
    let Some(age) = parse_age(arg) else {
        send_message_resilient(bot, msg.chat.id, "Usage: /verify <age>", None).await?;
        return Ok(());
    };

    let Some(user_id) = sender_id(msg) else {
        send_message_resilient(bot, msg.chat.id, NO_SENDER_REPLY, None).await?;
        return Ok(());
    };

    let reply = match gateway.verify(user_id, age).await {
        Ok(record) => {
            info!(identity = %record.identity, "User verified via command");
            "✅ You're verified. Try /fetch <category>.".to_string()
        }
        Err(PolicyError::TooYoung { minimum, .. }) => {
            format!("🚫 You must be at least {minimum} to use this.")
        }
        Err(e) => {
            warn!(chat_id = msg.chat.id.0, error = %e, "Verification rejected");
            "⚠️ Couldn't verify you. Please try again later.".to_string()
        }
    };
    send_message_resilient(bot, msg.chat.id, reply, None).await?;
    Ok(())
}

async fn fetch(bot: &Bot, msg: &Message, gateway: &GatewayOrchestrator, arg: &str) -> Result<()> {
    let category = arg.trim();
    if category.is_empty() {
        let names: Vec<&str> = gateway.catalog().names().collect();
        let text = format!("Usage: /fetch <category>\nAvailable: {}", names.join(", "));
        send_message_resilient(bot, msg.chat.id, text, None).await?;
        return Ok(());
    }

    let Some(user_id) = sender_id(msg) else {
        send_message_resilient(bot, msg.chat.id, NO_SENDER_REPLY, None).await?;
        return Ok(());
    };

    let result = gateway
        .handle_content_request(user_id, &conversation_id(msg), category)
        .await;
    match result {
        Ok(delivery) => {
            if let Err(e) = send_media_resilient(bot, msg.chat.id, &delivery).await {
                warn!(chat_id = msg.chat.id.0, url = %delivery.url, error = %e, "Media delivery failed, sending link");
                send_message_resilient(bot, msg.chat.id, delivery.url, None).await?;
            }
        }
        Err(denial) => {
            send_message_resilient(bot, msg.chat.id, denial.message(), None).await?;
        }
    }
    Ok(())
}

async fn toggle(bot: &Bot, msg: &Message, gateway: &GatewayOrchestrator, arg: &str) -> Result<()> {
    let Some(enabled) = parse_toggle(arg) else {
        send_message_resilient(bot, msg.chat.id, "Usage: /toggle on|off", None).await?;
        return Ok(());
    };

    if !msg.chat.is_private() && !is_chat_admin(bot, msg).await {
        send_message_resilient(
            bot,
            msg.chat.id,
            "⛔️ Only chat administrators can change this.",
            None,
        )
        .await?;
        return Ok(());
    }

    let reply = match gateway.toggle_feature(&conversation_id(msg), enabled).await {
        Ok(policy) if policy.enabled => "✅ Media commands are now on in this chat.",
        Ok(_) => "🔒 Media commands are now off in this chat.",
        Err(e) => {
            warn!(chat_id = msg.chat.id.0, error = %e, "Toggle failed");
            "⚠️ Couldn't save the setting. Please try again later."
        }
    };
    send_message_resilient(bot, msg.chat.id, reply, None).await?;
    Ok(())
}

async fn is_chat_admin(bot: &Bot, msg: &Message) -> bool {
    let Some(user) = msg.from.as_ref() else {
        return false;
    };
    match bot.get_chat_member(msg.chat.id, user.id).await {
        Ok(member) => member.is_privileged(),
        Err(e) => {
            warn!(chat_id = msg.chat.id.0, error = %e, "Failed to look up chat member");
            false
        }
    }
}

async fn stats(bot: &Bot, msg: &Message, gateway: &GatewayOrchestrator) -> Result<()> {
    let snapshot = gateway.stats().await;
    let text = format_stats(&snapshot, gateway.limiter().denied_count());
    send_message_resilient(bot, msg.chat.id, text, Some(ParseMode::Html)).await?;
    Ok(())
}

/// HTML list of configured categories
#[must_use]
pub fn format_categories(catalog: &SourceCatalog) -> String {
    if catalog.is_empty() {
        return "No categories are configured.".to_string();
    }
    let names: Vec<String> = catalog
        .names()
        .map(|name| format!("<code>{}</code>", html_escape::encode_text(name)))
        .collect();
    format!("<b>Categories:</b> {}", names.join(", "))
}

/// HTML summary for `/stats`
#[must_use]
pub fn format_stats(stats: &GatewayStats, denied_acquisitions: u64) -> String {
    format!(
        "📊 <b>Gateway stats</b>\n\n\
         Verified users: <b>{}</b>\n\
         Active cooldowns: <b>{}</b>\n\
         Categories: <b>{}</b>\n\n\
         Served (primary / fallback / last resort): <b>{}</b> / <b>{}</b> / <b>{}</b>\n\
         Upstream failures: <b>{}</b>\n\
         Slow fetches: <b>{}</b>\n\n\
         Denied (disabled / unverified / cooldown): <b>{}</b> / <b>{}</b> / <b>{}</b>\n\
         Rejected cooldown acquisitions: <b>{}</b>",
        stats.verified_identities,
        stats.active_cooldowns,
        stats.categories,
        stats.served_primary,
        stats.served_fallback,
        stats.served_last_resort,
        stats.failed,
        stats.slow_fetches,
        stats.denied_feature,
        stats.denied_unverified,
        stats.denied_cooldown,
        denied_acquisitions,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::catalog::Category;
    use crate::gateway::validator::MediaKind;

    #[test]
    fn test_command_parsing() {
        assert_eq!(
            Command::parse("/verify 21", "gatewaybot").ok(),
            Some(Command::Verify("21".to_string()))
        );
        assert_eq!(
            Command::parse("/fetch waifu", "gatewaybot").ok(),
            Some(Command::Fetch("waifu".to_string()))
        );
        assert_eq!(
            Command::parse("/toggle@gatewaybot off", "gatewaybot").ok(),
            Some(Command::Toggle("off".to_string()))
        );
        assert_eq!(Command::parse("/stats", "gatewaybot").ok(), Some(Command::Stats));
        assert!(Command::parse("/unknown", "gatewaybot").is_err());
    }

    fn message(extra: serde_json::Value) -> Message {
        let mut value = serde_json::json!({
            "message_id": 1,
            "date": 1_700_000_000,
            "chat": {"id": -100_123, "type": "supergroup", "title": "group"},
            "text": "/verify 21"
        });
        if let (Some(base), Some(extra)) = (value.as_object_mut(), extra.as_object()) {
            base.extend(extra.clone());
        }
        serde_json::from_value(value).unwrap_or_else(|e| panic!("test message: {e}"))
    }

    #[test]
    fn test_sender_id_requires_a_user() {
        let from_user = message(serde_json::json!({
            "from": {"id": 42, "is_bot": false, "first_name": "Ann"}
        }));
        assert_eq!(sender_id(&from_user), Some(42));

        let channel_post = message(serde_json::json!({
            "sender_chat": {"id": -100_555, "type": "channel", "title": "news"}
        }));
        assert_eq!(sender_id(&channel_post), None);

        let anonymous_admin = message(serde_json::json!({
            "from": {"id": 1_087_968_824, "is_bot": true, "first_name": "Group", "username": "GroupAnonymousBot"},
            "sender_chat": {"id": -100_123, "type": "supergroup", "title": "group"}
        }));
        assert_eq!(sender_id(&anonymous_admin), None);
    }

    #[test]
    fn test_parse_age() {
        assert_eq!(parse_age(" 18 "), Some(18));
        assert_eq!(parse_age("-3"), None);
        assert_eq!(parse_age("eighteen"), None);
        assert_eq!(parse_age(""), None);
    }

    #[test]
    fn test_parse_toggle() {
        assert_eq!(parse_toggle("on"), Some(true));
        assert_eq!(parse_toggle("OFF"), Some(false));
        assert_eq!(parse_toggle(" enable "), Some(true));
        assert_eq!(parse_toggle("maybe"), None);
    }

    #[test]
    fn test_format_categories_escapes_names() {
        let catalog = SourceCatalog::new([Category {
            name: "a<b>".to_string(),
            kind: MediaKind::Static,
            endpoints: vec![],
            last_resort: None,
            caption: None,
        }]);
        let text = format_categories(&catalog);
        assert!(text.contains("a&lt;b&gt;"));
        assert_eq!(
            format_categories(&SourceCatalog::default()),
            "No categories are configured."
        );
    }

    #[test]
    fn test_format_stats() {
        let stats = GatewayStats {
            verified_identities: 3,
            served_fallback: 2,
            denied_cooldown: 5,
            ..GatewayStats::default()
        };
        let text = format_stats(&stats, 5);
        assert!(text.contains("Verified users: <b>3</b>"));
        assert!(text.contains("Active cooldowns: <b>0</b>"));
        assert!(text.contains("<b>0</b> / <b>2</b> / <b>0</b>"));
        assert!(text.contains("Rejected cooldown acquisitions: <b>5</b>"));
    }
}
