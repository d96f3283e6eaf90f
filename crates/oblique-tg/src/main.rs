use futures::prelude::*;
use oblique_tg::tracing_err;
use std::panic::AssertUnwindSafe;
use std::process::ExitCode;
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
    if dotenvy::dotenv().is_err() {
        eprintln!("Dotenv config was not found, ignoring this...")
    }

    let logging_task = oblique_tg::init_logging();

    oblique_tg::init_metrics();

    let exit_code = AssertUnwindSafe(async {
        let result = try_main().await;

        result.map(|()| ExitCode::SUCCESS).unwrap_or_else(|err| {
            error!(err = tracing_err(&err), "Exitting with an error...");
            ExitCode::FAILURE
        })
    })
    .catch_unwind()
    .unwrap_or_else(|_| {
        error!("Exitting due to a panic...");
        ExitCode::FAILURE
    })
    .await;

    logging_task.shutdown().await;

    exit_code
}

async fn try_main() -> oblique_tg::Result {
    let config = oblique_tg::Config::load_or_panic();
    oblique_tg::run(config).await
}
