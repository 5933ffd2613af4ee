//! Address inputs repository: latest metrics and score pushed by upstream

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct AddressInputsRow {
    pub address: String,
    pub metrics: String,
    pub transactions: String,
    pub score: f64,
    pub components: String,
    pub updated_at: i64,
}

pub struct InputsRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> InputsRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn save(&self, inputs: &AddressInputsRow) -> DbResult<()> {
        sqlx::query(
            r#"INSERT INTO address_inputs (address, metrics, transactions, score, components, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)
               ON CONFLICT(address) DO UPDATE SET
                 metrics = excluded.metrics,
                 transactions = excluded.transactions,
                 score = excluded.score,
                 components = excluded.components,
                 updated_at = excluded.updated_at
            "#,
        )
        .bind(&inputs.address)
        .bind(&inputs.metrics)
        .bind(&inputs.transactions)
        .bind(inputs.score)
        .bind(&inputs.components)
        .bind(inputs.updated_at)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, address: &str) -> DbResult<Option<AddressInputsRow>> {
        let row = sqlx::query_as::<_, AddressInputsRow>(
            "SELECT address, metrics, transactions, score, components, updated_at
             FROM address_inputs WHERE address = ?1",
        )
        .bind(address)
        .fetch_optional(self.pool)
        .await?;

        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    #[tokio::test]
    async fn test_save_overwrites_previous_inputs() {
        let db = Database::in_memory().await.unwrap();
        let repo = InputsRepository::new(db.pool());

        let mut inputs = AddressInputsRow {
            address: "0xa".into(),
            metrics: r#"{"accountAge":10}"#.into(),
            transactions: "[]".into(),
            score: 400.0,
            components: "{}".into(),
            updated_at: 1,
        };
        repo.save(&inputs).await.unwrap();
        inputs.score = 720.0;
        inputs.updated_at = 2;
        repo.save(&inputs).await.unwrap();

        assert_eq!(repo.get("0xa").await.unwrap(), Some(inputs));
        assert_eq!(repo.get("0xb").await.unwrap(), None);
    }
}
