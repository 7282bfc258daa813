//! Schema management: DDL, migration and the startup version gate.
//!
//! Creating or migrating the schema is an administrative operation,
//! separate from normal Store usage. [`Store::connect`][crate::Store::connect]
//! refuses to start when the installed schema version is older than
//! [`SCHEMA_VERSION`].

use sqlx::PgPool;

use crate::config::Config;

/// The schema version this crate expects to find installed.
pub const SCHEMA_VERSION: i64 = 1;

/// All possible error types returned by [`Schema::migrate`] and
/// [`Schema::verify`].
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// The store schema has not been installed in the target database.
    #[error("store schema is not installed, run the schema migration first")]
    Missing,

    /// The installed schema is older than the version supported by this
    /// crate.
    #[error("store schema version {found} is older than the supported version {expected}, run the schema migration first")]
    Outdated {
        /// The version found in the database.
        found: i64,
        /// The version this crate expects.
        expected: i64,
    },

    /// The db returned an error.
    #[error("db returned an error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A handle over the (possibly prefixed) schema hosting the store tables.
#[derive(Debug, Clone)]
pub struct Schema {
    name: String,
    channel: String,
}

impl Schema {
    /// Creates a handle for the schema selected by the given [Config].
    ///
    /// The schema name is normalized to a safe SQL identifier: anything
    /// other than ASCII alphanumerics and underscores is stripped.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let name: String = config
            .schema
            .as_deref()
            .unwrap_or("public")
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();

        let name = if name.is_empty() {
            "public".to_owned()
        } else {
            name.to_lowercase()
        };

        let channel = format!("{name}_log_commits");

        Self { name, channel }
    }

    /// The schema name store tables live under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The `NOTIFY` channel commit notifications are published on.
    /// Derived from the schema name, so multiple Stores in one database
    /// do not observe each other's commits.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Renders a schema-qualified table (or sequence) name.
    pub(crate) fn table(&self, name: &str) -> String {
        format!("{}.{}", self.name, name)
    }

    /// Key string hashed into the per-stream advisory lock.
    pub(crate) fn stream_lock_key(&self, stream_id: &str) -> String {
        format!("{}/{}", self.name, stream_id)
    }

    /// Key string hashed into the global-log advisory lock, serializing
    /// sequence reservation across appenders at commit.
    pub(crate) fn log_lock_key(&self) -> String {
        format!("{}/$all", self.name)
    }

    fn steps(&self) -> Vec<(i64, Vec<String>)> {
        let s = &self.name;

        vec![(
            1,
            vec![
                format!(
                    r"CREATE TABLE {s}.streams (
                        id BIGSERIAL PRIMARY KEY,
                        stream_id TEXT NOT NULL UNIQUE CHECK (stream_id <> ''),
                        stream_version BIGINT NOT NULL DEFAULT 0,
                        deleted_state TEXT NOT NULL DEFAULT 'live'
                            CHECK (deleted_state IN ('live', 'soft_deleted', 'hard_deleted')),
                        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
                    )"
                ),
                format!("CREATE SEQUENCE {s}.global_log_sequence"),
                format!(
                    r"CREATE TABLE {s}.events (
                        event_id UUID PRIMARY KEY,
                        stream_id BIGINT NOT NULL REFERENCES {s}.streams (id),
                        stream_version BIGINT NOT NULL,
                        event_type TEXT NOT NULL,
                        data BYTEA NOT NULL,
                        metadata BYTEA NOT NULL DEFAULT ''::bytea,
                        causation_id UUID,
                        correlation_id UUID,
                        sequence_number BIGINT NOT NULL UNIQUE,
                        recorded_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                        UNIQUE (stream_id, stream_version)
                    )"
                ),
                format!(
                    r"CREATE TABLE {s}.stream_events (
                        stream_id BIGINT NOT NULL REFERENCES {s}.streams (id) ON DELETE CASCADE,
                        stream_version BIGINT NOT NULL,
                        event_id UUID NOT NULL REFERENCES {s}.events (event_id) ON DELETE CASCADE,
                        original_stream_id BIGINT NOT NULL,
                        original_stream_version BIGINT NOT NULL,
                        PRIMARY KEY (stream_id, stream_version),
                        UNIQUE (stream_id, event_id)
                    )"
                ),
                format!("CREATE INDEX stream_events_event_id_idx ON {s}.stream_events (event_id)"),
                format!(
                    r"CREATE TABLE {s}.subscriptions (
                        id BIGSERIAL PRIMARY KEY,
                        stream_id TEXT NOT NULL,
                        name TEXT NOT NULL,
                        last_seen BIGINT NOT NULL DEFAULT 0,
                        state TEXT NOT NULL DEFAULT 'initial',
                        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                        UNIQUE (stream_id, name)
                    )"
                ),
                format!(
                    r"CREATE TABLE {s}.subscription_parked (
                        subscription_id BIGINT NOT NULL
                            REFERENCES {s}.subscriptions (id) ON DELETE CASCADE,
                        position BIGINT NOT NULL,
                        event_id UUID NOT NULL,
                        stream_id TEXT NOT NULL,
                        reason TEXT NOT NULL DEFAULT '',
                        parked_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                        PRIMARY KEY (subscription_id, position)
                    )"
                ),
            ],
        )]
    }

    /// Creates the schema if needed and applies every migration step
    /// newer than the installed version.
    pub async fn migrate(&self, pool: &PgPool) -> Result<(), SchemaError> {
        let mut tx = pool.begin().await?;

        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", self.name))
            .execute(&mut *tx)
            .await?;

        sqlx::query(&format!(
            r"CREATE TABLE IF NOT EXISTS {} (
                version BIGINT PRIMARY KEY,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
            self.table("schema_migrations"),
        ))
        .execute(&mut *tx)
        .await?;

        let installed: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT MAX(version) FROM {}",
            self.table("schema_migrations"),
        ))
        .fetch_one(&mut *tx)
        .await?;
        let installed = installed.unwrap_or(0);

        for (version, statements) in self.steps() {
            if version <= installed {
                continue;
            }

            tracing::info!(
                schema = %self.name,
                schema.version = version,
                "applying store schema migration"
            );

            for statement in statements {
                sqlx::query(&statement).execute(&mut *tx).await?;
            }

            sqlx::query(&format!(
                "INSERT INTO {} (version) VALUES ($1)",
                self.table("schema_migrations"),
            ))
            .bind(version)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(())
    }

    /// Checks that the installed schema is at least [`SCHEMA_VERSION`].
    pub async fn verify(&self, pool: &PgPool) -> Result<(), SchemaError> {
        let installed: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT MAX(version) FROM {}",
            self.table("schema_migrations"),
        ))
        .fetch_one(pool)
        .await
        .map_err(|error| match &error {
            // 42P01: undefined_table, the schema has never been installed.
            sqlx::Error::Database(db) if db.code().as_deref() == Some("42P01") => {
                SchemaError::Missing
            },
            _ => SchemaError::Database(error),
        })?;

        match installed.unwrap_or(0) {
            0 => Err(SchemaError::Missing),
            found if found < SCHEMA_VERSION => Err(SchemaError::Outdated {
                found,
                expected: SCHEMA_VERSION,
            }),
            _ => Ok(()),
        }
    }
}
