use crate::prelude::*;
use crate::recipient::{Recipient, RecipientId, RecipientStore};
use crate::Result;
use async_trait::async_trait;

pub(crate) struct PgRecipientStore {
    db: sqlx::PgPool,
}

#[derive(sqlx::FromRow)]
struct Record {
    chat_id: String,
    last_notified_at: i64,
}

impl PgRecipientStore {
    pub(crate) fn new(db: sqlx::PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RecipientStore for PgRecipientStore {
    #[instrument(skip(self))]
    async fn get_all(&self) -> Result<Vec<Recipient>> {
        let records: Vec<Record> = sqlx::query_as(
            "select chat_id, last_notified_at from tg_recipients
            order by chat_id",
        )
        .fetch_all(&self.db)
        .await?;

        Ok(records
            .into_iter()
            .map(|Record { chat_id, last_notified_at }| Recipient {
                id: RecipientId(chat_id),
                last_notified_at,
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn upsert_new(&self, id: &RecipientId) -> Result {
        let result = sqlx::query(
            "insert into tg_recipients (chat_id, last_notified_at)
            values ($1, 0)
            on conflict (chat_id) do nothing",
        )
        .bind(&id.0)
        .execute(&self.db)
        .await?;

        if result.rows_affected() > 0 {
            info!("Registered a new recipient");
        }

        Ok(())
    }

    #[instrument(skip(self))]
    async fn update_last_notified(&self, id: &RecipientId, timestamp: i64) -> Result {
        let result = sqlx::query(
            "update tg_recipients set last_notified_at = $2
            where chat_id = $1",
        )
        .bind(&id.0)
        .bind(timestamp)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            warn!("Recipient was not found when updating its timestamp");
        }

        Ok(())
    }
}
