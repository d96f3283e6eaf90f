//! Telegram Bot API integration

mod config;
mod inbound;
mod notifier;

pub(crate) use config::*;
pub(crate) use inbound::*;
pub(crate) use notifier::*;

use crate::prelude::*;
use crate::Result;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;

/// The commands are routed by a substring match of the message text, this
/// enum only describes them for the Telegram command menu
#[derive(BotCommands, Clone, Debug)]
#[command(rename_rule = "lowercase", description = "Commands:")]
pub(crate) enum Cmd {
    #[command(description = "learn what this bot does")]
    Start,
    #[command(description = "draw a card right now")]
    Ver,
}

/// Points Telegram to the webhook endpoint of this server and publishes the
/// command menu. Does nothing if the public webhook URL isn't configured.
pub(crate) async fn register_webhook(cfg: &Config) -> Result {
    let Some(webhook_url) = &cfg.webhook_url else {
        info!("Webhook URL is not configured, skipping the webhook registration");
        return Ok(());
    };

    let bot = Bot::with_client(&cfg.token, teloxide::net::client_from_env())
        .set_api_url(cfg.api_url.clone());

    let mut request = bot.set_webhook(webhook_url.clone());

    if let Some(secret) = &cfg.webhook_secret {
        request = request.secret_token(secret.clone());
    }

    request.await?;

    bot.set_my_commands(Cmd::bot_commands()).await?;

    info!(%webhook_url, "Registered the webhook and the command menu");

    Ok(())
}
