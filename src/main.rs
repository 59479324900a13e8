use blacksky_gateway::bot::handlers::{handle_command, Command};
use blacksky_gateway::config::GatewaySettings;
use blacksky_gateway::gateway::clock::SystemClock;
use blacksky_gateway::gateway::upstream::HttpUpstream;
use blacksky_gateway::gateway::GatewayOrchestrator;
use blacksky_gateway::logging::{self, LogRedactor};
use blacksky_gateway::storage::JsonFileSettingsStore;
use dotenvy::dotenv;
use std::sync::Arc;
use std::time::Duration;
use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file
    dotenv().ok();

    // Redaction must be ready before the first log line
    let redactor = LogRedactor::new()
        .map_err(|e| {
            eprintln!("Failed to compile redaction patterns: {e}");
            e
        })?
        .with_secret(std::env::var("TELEGRAM_TOKEN").ok());
    logging::init(redactor);

    info!("Starting content gateway bot...");

    let settings = init_settings();
    let gateway = init_gateway(&settings).await;
    spawn_cooldown_sweeper(gateway.clone(), settings.cooldown_sweep_secs);

    let bot = Bot::new(settings.telegram_token.clone());
    let handler = setup_handler();

    info!("Bot is running...");

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![gateway])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

fn init_settings() -> GatewaySettings {
    match GatewaySettings::new() {
        Ok(s) if s.telegram_token.trim().is_empty() => {
            error!("TELEGRAM_TOKEN is not set");
            std::process::exit(1);
        }
        Ok(s) => {
            info!("Configuration loaded successfully.");
            s
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    }
}

async fn init_gateway(settings: &GatewaySettings) -> Arc<GatewayOrchestrator> {
    let group_settings = Arc::new(JsonFileSettingsStore::new(settings.group_settings_path()));
    let upstream = Arc::new(HttpUpstream::new(
        &settings.user_agent,
        settings.fetch_timeout(),
    ));
    let gateway = GatewayOrchestrator::from_settings(
        settings,
        Arc::new(SystemClock),
        group_settings,
        upstream,
    )
    .await;

    let verified = gateway.policy().verified_count().await;
    info!(
        data_dir = %settings.data_dir.display(),
        categories = gateway.catalog().len(),
        verified,
        "Gateway initialized."
    );
    Arc::new(gateway)
}

fn spawn_cooldown_sweeper(gateway: Arc<GatewayOrchestrator>, every_secs: u64) {
    if every_secs == 0 {
        info!("Cooldown sweeping disabled.");
        return;
    }

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(every_secs));
        // The first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            let removed = gateway.limiter().sweep_expired();
            debug!(
                removed,
                remaining = gateway.limiter().entry_count(),
                "Cooldown sweep finished"
            );
        }
    });
}

fn setup_handler() -> UpdateHandler<teloxide::RequestError> {
    dptree::entry().branch(
        Update::filter_message()
            .filter_command::<Command>()
            .endpoint(on_command),
    )
}

async fn on_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    gateway: Arc<GatewayOrchestrator>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = handle_command(bot, msg, cmd, gateway).await {
        error!("Command error: {}", e);
    }
    respond(())
}
