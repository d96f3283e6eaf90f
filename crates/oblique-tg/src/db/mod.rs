mod cfg;
mod recipient;

use crate::prelude::*;
use crate::Result;
use sqlx::postgres::PgPoolOptions;

pub(crate) use cfg::*;
pub(crate) use recipient::*;

pub(crate) async fn init(cfg: Config) -> Result<sqlx::PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(cfg.pool_size)
        // Verify that the connection is working early.
        // The connection created here can also be reused by the migrations down the road.
        // The default idle timeout should be enough for that.
        .connect(cfg.url.as_str())
        .await
        .map_err(err_ctx!(DbError::Connect))?;

    sqlx::migrate!()
        .run(&pool)
        .await
        .map_err(err_ctx!(DbError::Migrate))?;

    info!("Database is ready");

    Ok(pool)
}

/// Most likely unrecoverable errors from database communication layer
#[derive(Debug, thiserror::Error)]
pub(crate) enum DbError {
    #[error("Failed to connect to the database")]
    Connect { source: sqlx::Error },

    #[error("Failed to migrate the database")]
    Migrate { source: sqlx::migrate::MigrateError },

    #[error("Database query failed")]
    Query {
        #[from]
        source: sqlx::Error,
    },
}

impl From<sqlx::Error> for crate::error::ErrorKind {
    fn from(err: sqlx::Error) -> Self {
        Self::Db { source: err.into() }
    }
}
