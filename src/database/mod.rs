use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, Sqlite, SqlitePool, migrate::MigrateDatabase};
use tracing::{debug, info};

use crate::models::{PriceRow, ScrapeStatus};
use crate::traits::ResultSink;

/// Price history, keyed by run so that an interrupted run can resume
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn connect(db_url: &str) -> Result<Self> {
        if let Some(parent) = database_file(db_url).and_then(|path| path.parent())
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Create database file if it doesn't exist
        if !Sqlite::database_exists(db_url).await.unwrap_or(false) {
            info!("Creating database file");
            Sqlite::create_database(db_url).await?;
        }

        // One connection: writes are serial and in-memory databases stay shared
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(db_url)
            .await?;

        info!("Running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;

        info!("Database initialized successfully");
        Ok(Self { pool })
    }

    /// Key of the run for this input: the latest unfinished one when resuming,
    /// otherwise a new one
    pub async fn open_run(&self, input_key: &str, mode: &str, resume: bool) -> Result<String> {
        if resume {
            let unfinished = sqlx::query(
                r"
                SELECT run_key FROM runs
                WHERE input_key = ? AND finished_at IS NULL
                ORDER BY rowid DESC
                LIMIT 1
                ",
            )
            .bind(input_key)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = unfinished {
                let run_key: String = row.get("run_key");
                info!("Resuming unfinished run {}", run_key);
                return Ok(run_key);
            }
        }

        let earlier: i64 = sqlx::query("SELECT COUNT(*) AS count FROM runs WHERE input_key = ?")
            .bind(input_key)
            .fetch_one(&self.pool)
            .await?
            .get("count");
        let run_key = format!("{}-{}", input_key, earlier + 1);

        sqlx::query("INSERT INTO runs (run_key, input_key, mode, started_at) VALUES (?, ?, ?, ?)")
            .bind(&run_key)
            .bind(input_key)
            .bind(mode)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        debug!("Opened run {}", run_key);
        Ok(run_key)
    }

    /// A finished run is never resumed
    pub async fn finish_run(&self, run_key: &str) -> Result<()> {
        sqlx::query("UPDATE runs SET finished_at = ? WHERE run_key = ?")
            .bind(Utc::now())
            .bind(run_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Insert rows, replacing any earlier row for the same article in this run
    pub async fn save_rows(&self, run_key: &str, rows: &[PriceRow]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for row in rows {
            sqlx::query(
                r"
                INSERT OR REPLACE INTO price_rows (
                    run_key, scraped_at, cabinet, article, title,
                    price_before_discount, price_after_discount, price_with_card,
                    discount_percent, card_discount_percent, stock_count, status
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ",
            )
            .bind(run_key)
            .bind(row.scraped_at)
            .bind(&row.cabinet)
            .bind(&row.article)
            .bind(&row.title)
            .bind(row.price_before_discount)
            .bind(row.price_after_discount)
            .bind(row.price_with_card)
            .bind(row.discount_percent)
            .bind(row.card_discount_percent)
            .bind(row.stock_count)
            .bind(row.status.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!("Stored {} rows for run {}", rows.len(), run_key);
        Ok(())
    }

    /// Rows of a run that need no further scraping
    pub async fn completed_rows(&self, run_key: &str) -> Result<Vec<PriceRow>> {
        let rows = sqlx::query(
            r"
            SELECT scraped_at, cabinet, article, title,
                   price_before_discount, price_after_discount, price_with_card,
                   discount_percent, card_discount_percent, stock_count, status
            FROM price_rows
            WHERE run_key = ?
            ORDER BY id
            ",
        )
        .bind(run_key)
        .fetch_all(&self.pool)
        .await?;

        let mut rows = rows
            .into_iter()
            .map(|row| -> Result<PriceRow> {
                Ok(PriceRow {
                    scraped_at: row.get::<DateTime<Utc>, _>("scraped_at"),
                    cabinet: row.get("cabinet"),
                    article: row.get("article"),
                    title: row.get("title"),
                    price_before_discount: row.get("price_before_discount"),
                    price_after_discount: row.get("price_after_discount"),
                    price_with_card: row.get("price_with_card"),
                    discount_percent: row.get("discount_percent"),
                    card_discount_percent: row.get("card_discount_percent"),
                    stock_count: row.get("stock_count"),
                    status: row.get::<String, _>("status").parse::<ScrapeStatus>()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        rows.retain(|row| row.status.is_final());
        Ok(rows)
    }

    /// Sink that stores every checkpoint under `run_key`
    pub fn sink(&self, run_key: impl Into<String>) -> DatabaseSink {
        DatabaseSink {
            database: self.clone(),
            run_key: run_key.into(),
        }
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}

/// Path of the file behind a `sqlite:` URL, if it names one
fn database_file(db_url: &str) -> Option<&Path> {
    let rest = db_url.strip_prefix("sqlite:")?;
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let path = rest.split('?').next().unwrap_or_default();
    (!path.is_empty() && !path.contains(":memory:")).then(|| Path::new(path))
}

pub struct DatabaseSink {
    database: Database,
    run_key: String,
}

#[async_trait]
impl ResultSink for DatabaseSink {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn save(&self, _all: &[PriceRow], fresh: &[PriceRow]) -> Result<()> {
        self.database.save_rows(&self.run_key, fresh).await
    }
}
