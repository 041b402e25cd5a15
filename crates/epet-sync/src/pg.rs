use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::loader::{
    CommentRow, LookupEntry, PetitionRow, RelationalStore, SignerRow, StoreError,
};

/// `RelationalStore` over the Postgres schema in `migrations/`.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .context("connecting to database")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")
    }
}

#[async_trait]
impl RelationalStore for PgStore {
    async fn lookup_id(&self, entry: &LookupEntry) -> Result<Option<i64>, StoreError> {
        let sql = match entry {
            LookupEntry::Named { table, .. } => {
                format!("SELECT id FROM {} WHERE name = $1", table.table_name())
            }
            LookupEntry::Organization { .. } => {
                "SELECT id FROM organizations WHERE external_id = $1".to_string()
            }
            LookupEntry::Location { .. } => {
                "SELECT id FROM locations WHERE natural_key = $1".to_string()
            }
            LookupEntry::File { .. } => "SELECT id FROM files WHERE external_id = $1".to_string(),
        };
        let row = sqlx::query(&sql)
            .bind(entry.natural_key())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.try_get::<i64, _>("id")).transpose()?)
    }

    async fn insert_lookup(&self, entry: &LookupEntry) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        match entry {
            LookupEntry::Named { table, name } => {
                let sql = format!(
                    "INSERT INTO {} (name) VALUES ($1) ON CONFLICT (name) DO NOTHING",
                    table.table_name()
                );
                sqlx::query(&sql).bind(name).execute(&mut *tx).await?;
            }
            LookupEntry::Organization { external_id, name } => {
                sqlx::query(
                    r#"
                    INSERT INTO organizations (external_id, name)
                    VALUES ($1, $2)
                    ON CONFLICT (external_id) DO NOTHING
                    "#,
                )
                .bind(external_id)
                .bind(name)
                .execute(&mut *tx)
                .await?;
            }
            LookupEntry::Location {
                natural_key,
                latitude,
                longitude,
                address,
            } => {
                sqlx::query(
                    r#"
                    INSERT INTO locations (natural_key, latitude, longitude, address)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (natural_key) DO NOTHING
                    "#,
                )
                .bind(natural_key)
                .bind(latitude)
                .bind(longitude)
                .bind(address)
                .execute(&mut *tx)
                .await?;
            }
            LookupEntry::File {
                external_id,
                name,
                url,
                mime_type_id,
            } => {
                sqlx::query(
                    r#"
                    INSERT INTO files (external_id, name, url, mime_type_id)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (external_id) DO NOTHING
                    "#,
                )
                .bind(external_id)
                .bind(name)
                .bind(url)
                .bind(mime_type_id)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn petition_id(&self, external_id: &str) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query("SELECT id FROM petitions WHERE external_id = $1")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.try_get::<i64, _>("id")).transpose()?)
    }

    async fn insert_petition(&self, row: &PetitionRow) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO petitions (
                external_id, title, description, reg_number,
                state_id, source_id, language_id,
                apply_date, deadline,
                signers_count, required_count, viewers_count,
                cover_file_id, applicant_first_name, applicant_last_name,
                organization_id, location_id,
                decision_message_kk, decision_message_ru, decision_reply_date
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                    $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            RETURNING id
            "#,
        )
        .bind(&row.external_id)
        .bind(&row.title)
        .bind(&row.description)
        .bind(&row.reg_number)
        .bind(row.state_id)
        .bind(row.source_id)
        .bind(row.language_id)
        .bind(row.apply_date)
        .bind(row.deadline)
        .bind(row.signers_count)
        .bind(row.required_count)
        .bind(row.viewers_count)
        .bind(row.cover_file_id)
        .bind(&row.applicant_first_name)
        .bind(&row.applicant_last_name)
        .bind(row.organization_id)
        .bind(row.location_id)
        .bind(&row.decision_message_kk)
        .bind(&row.decision_message_ru)
        .bind(row.decision_reply_date)
        .fetch_one(&mut *tx)
        .await?;
        let id: i64 = inserted.try_get("id")?;
        tx.commit().await?;
        Ok(id)
    }

    async fn link_petition_file(&self, petition_id: i64, file_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO petition_files (petition_id, file_id)
            SELECT $1, $2
             WHERE NOT EXISTS (
                   SELECT 1 FROM petition_files WHERE petition_id = $1 AND file_id = $2
             )
            "#,
        )
        .bind(petition_id)
        .bind(file_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn comment_exists(&self, external_id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM comments WHERE external_id = $1) AS present")
            .bind(external_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("present")?)
    }

    async fn insert_comment(&self, row: &CommentRow) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            INSERT INTO comments (
                external_id, petition_id, parent_external_id,
                fio, body, replies_count, created_at
            )
            SELECT $1, p.id, $3, $4, $5, $6, $7
              FROM petitions p
             WHERE p.external_id = $2
            "#,
        )
        .bind(&row.external_id)
        .bind(&row.petition_external_id)
        .bind(&row.parent_external_id)
        .bind(&row.fio)
        .bind(&row.body)
        .bind(row.replies_count)
        .bind(row.created_at)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::MissingParent(row.petition_external_id.clone()));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn any_signer_since(&self, since: DateTime<Utc>) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM signers WHERE created_at >= $1) AS present")
            .bind(since)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("present")?)
    }

    async fn append_signers(&self, rows: &[SignerRow]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            let result = sqlx::query(
                r#"
                INSERT INTO signers (petition_id, fio, created_at)
                SELECT p.id, $2, $3
                  FROM petitions p
                 WHERE p.external_id = $1
                "#,
            )
            .bind(&row.petition_external_id)
            .bind(&row.fio)
            .bind(row.created_at)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                // Dropping `tx` rolls the whole batch back.
                return Err(StoreError::MissingParent(row.petition_external_id.clone()));
            }
        }
        tx.commit().await?;
        debug!(rows = rows.len(), "signers appended");
        Ok(rows.len())
    }
}
