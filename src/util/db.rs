use anyhow::{Context, Result};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    PgPool,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};

use crate::util::env::env_flag;

/// Tables the collectors write into. Idempotent; applied when AUTO_MIGRATE is on.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS collected_records (
    seq               BIGSERIAL PRIMARY KEY,
    collection        TEXT        NOT NULL,
    batch_date        DATE        NOT NULL,
    batch_kind        TEXT        NOT NULL,
    partition_key     TEXT        NOT NULL,
    partition_ordinal BIGINT,
    payload           JSONB       NOT NULL,
    inserted_at       TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (collection, batch_date, batch_kind, partition_key)
);
CREATE INDEX IF NOT EXISTS collected_records_kind_idx
    ON collected_records (collection, batch_kind, partition_ordinal DESC);

CREATE TABLE IF NOT EXISTS reconciled_entities (
    kind        TEXT        NOT NULL,
    entity_key  TEXT        NOT NULL,
    external_id BIGINT,
    status      TEXT        NOT NULL DEFAULT 'normal',
    attrs       JSONB       NOT NULL DEFAULT '{}'::jsonb,
    history     JSONB       NOT NULL DEFAULT '{}'::jsonb,
    updated_at  TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (kind, entity_key)
);
"#;

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let mut connect_options =
            PgConnectOptions::from_str(database_url).context("invalid database url")?;

        if database_url.contains("sslmode=require") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }

        if !env_flag("USE_PREPARED", false) {
            // PgBouncer txn mode safe
            connect_options = connect_options.statement_cache_capacity(0);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(connect_options)
            .await
            .context("failed to connect to database")?;
        info!(max_connections, "connected to db");

        let db = Self { pool };
        if env_flag("AUTO_MIGRATE", false) {
            info!("AUTO_MIGRATE on; ensuring collector schema");
            db.ensure_schema().await?;
        } else {
            info!("AUTO_MIGRATE disabled; skipping schema setup");
        }
        Ok(db)
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        // raw_sql: multiple statements, no prepared statements under PgBouncer
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("failed to apply collector schema")?;
        Ok(())
    }
}
