mod config;
mod db;
mod error;
mod http;
mod oblique;
mod observability;
mod recipient;
mod schedule;
mod server;
mod tg;

#[cfg(test)]
mod testing;

mod util;

pub use crate::error::*;
pub use config::*;
pub use observability::*;

#[allow(unused_imports)]
mod prelude {
    pub(crate) use crate::error::prelude::*;
    pub(crate) use crate::observability::logging::prelude::*;
}

use crate::prelude::*;
use schedule::trigger::{self, LocalTriggerFacility};
use schedule::{ControlLoop, ControlLoopDeps, SystemClock};
use std::sync::Arc;

/// Run the webhook server and the self-rescheduling notification loop
pub async fn run(config: Config) -> Result {
    let db = db::init(config.db).await?;

    let http = http::create_client();

    let store = Arc::new(db::PgRecipientStore::new(db));
    let notifier = Arc::new(tg::TgNotifier::new(&config.tg, http)?);
    let content = Arc::new(oblique::ObliqueDeck);

    let (facility, invocations) = LocalTriggerFacility::new([trigger::OBLIQUER]);

    let control_loop = Arc::new(ControlLoop::new(
        ControlLoopDeps {
            store: store.clone(),
            notifier: notifier.clone(),
            content: content.clone(),
            trigger: Arc::new(facility),
            clock: Arc::new(SystemClock),
        },
        config.schedule,
    )?);

    let inbound = Arc::new(tg::InboundHandler::new(store, notifier, content));

    tg::register_webhook(&config.tg).await?;

    // The facility lives in this process, so its rules are gone after a restart
    let next_run_in_minutes = control_loop.reschedule().await?;
    info!(?next_run_in_minutes, "Bootstrapped the notification schedule");

    let dispatcher = tokio::spawn(schedule::dispatch_invocations(
        invocations,
        control_loop.clone(),
    ));

    let state = server::AppState {
        inbound,
        control_loop,
        webhook_secret: config.tg.webhook_secret,
        trigger_token: config.server.trigger_token.clone(),
    };

    let result = server::serve(config.server, state).await;

    dispatcher.abort();

    result
}
