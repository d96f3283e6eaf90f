use super::Notifier;
use crate::oblique::ContentSource;
use crate::prelude::*;
use crate::recipient::{RecipientId, RecipientStore};
use crate::Result;
use serde::Deserialize;
use std::sync::Arc;
use teloxide::types::ChatId;

const WELCOME: &str = "Hey there! I'll be sending you an oblique strategy every few hours \
    during the day. You just go ahead and do your thing in the meantime.";

/// Subset of the Telegram `Update` object delivered to the webhook
#[derive(Debug, Deserialize)]
pub(crate) struct WebhookUpdate {
    pub(crate) message: Option<IncomingMessage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct IncomingMessage {
    pub(crate) chat: IncomingChat,

    /// Stickers, photos and other media messages have no text
    pub(crate) text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct IncomingChat {
    pub(crate) id: ChatId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    Start,
    Fetch,
    Unrecognized,
}

impl Route {
    /// The commands may appear anywhere in the text, e.g. `/start@bot_name`
    pub(crate) fn of(text: &str) -> Self {
        if text.contains("/start") {
            Self::Start
        } else if text.contains("/ver") {
            Self::Fetch
        } else {
            Self::Unrecognized
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Fetch => "fetch",
            Self::Unrecognized => "unrecognized",
        }
    }
}

fn unrecognized_reply(text: &str) -> String {
    format!("You said \"{text}\", but I didn't get it. I only understand /start and /ver.")
}

/// Registers the senders of the messages as recipients and replies to
/// their commands
pub(crate) struct InboundHandler {
    store: Arc<dyn RecipientStore>,
    notifier: Arc<dyn Notifier>,
    content: Arc<dyn ContentSource>,
}

impl InboundHandler {
    pub(crate) fn new(
        store: Arc<dyn RecipientStore>,
        notifier: Arc<dyn Notifier>,
        content: Arc<dyn ContentSource>,
    ) -> Self {
        Self {
            store,
            notifier,
            content,
        }
    }

    #[instrument(skip_all)]
    pub(crate) async fn handle(&self, update: WebhookUpdate) -> Result {
        let Some(message) = update.message else {
            debug!("Ignoring an update without a message");
            return Ok(());
        };

        let recipient = RecipientId::from(message.chat.id);
        let text = message.text.unwrap_or_default();

        self.store.upsert_new(&recipient).await?;

        let route = Route::of(&text);

        metrics::counter!("tg_inbound_messages_total", 1, "route" => route.label());

        let reply = match route {
            Route::Start => WELCOME.to_owned(),
            Route::Fetch => self.content.random(),
            Route::Unrecognized => unrecognized_reply(&text),
        };

        info!(%recipient, ?route, "Replying to the message");

        self.notifier.send(&reply, &recipient).await
    }
}
