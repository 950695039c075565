//! Database schema definitions using SurrealQL.
//!
//! Timestamps are stored as integer microseconds since the Unix epoch so that
//! eligibility and lease comparisons are plain integer comparisons.

use crate::{Database, DbError};

/// Initialize the database schema.
///
/// This creates all necessary tables, fields, and indexes.
pub async fn init_schema(db: &Database) -> Result<(), DbError> {
    tracing::debug!("Initializing database schema...");

    db.query(JOB_SCHEMA).await?.check()?;
    db.query(WORKER_SCHEMA).await?.check()?;
    db.query(SETTINGS_SCHEMA).await?.check()?;

    tracing::debug!("Database schema initialized");

    Ok(())
}

/// Job table schema.
const JOB_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS job SCHEMAFULL;

DEFINE FIELD IF NOT EXISTS job_id ON job TYPE string;
DEFINE FIELD IF NOT EXISTS command ON job TYPE string;
DEFINE FIELD IF NOT EXISTS args ON job TYPE array<string> DEFAULT [];
DEFINE FIELD IF NOT EXISTS priority ON job TYPE int DEFAULT 0;
DEFINE FIELD IF NOT EXISTS state ON job TYPE string
    ASSERT $value INSIDE ["pending", "processing", "completed", "failed", "dead"];
DEFINE FIELD IF NOT EXISTS scheduled_at ON job TYPE int;
DEFINE FIELD IF NOT EXISTS attempts ON job TYPE int DEFAULT 0;
DEFINE FIELD IF NOT EXISTS max_retries ON job TYPE int;
DEFINE FIELD IF NOT EXISTS timeout_secs ON job TYPE int;
DEFINE FIELD IF NOT EXISTS lease_owner ON job TYPE option<string>;
DEFINE FIELD IF NOT EXISTS lease_expires_at ON job TYPE option<int>;
DEFINE FIELD IF NOT EXISTS last_error ON job TYPE option<string>;
DEFINE FIELD IF NOT EXISTS output_log ON job TYPE option<string>;
DEFINE FIELD IF NOT EXISTS created_at ON job TYPE int;
DEFINE FIELD IF NOT EXISTS updated_at ON job TYPE int;

DEFINE INDEX IF NOT EXISTS job_state ON job FIELDS state;
DEFINE INDEX IF NOT EXISTS job_created ON job FIELDS created_at;

-- Compound index for claim polling
DEFINE INDEX IF NOT EXISTS job_claim ON job FIELDS state, scheduled_at, priority;
"#;

/// Worker liveness rows, published by running pools.
const WORKER_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS worker SCHEMAFULL;

DEFINE FIELD IF NOT EXISTS worker_id ON worker TYPE string;
DEFINE FIELD IF NOT EXISTS pool_id ON worker TYPE string;
DEFINE FIELD IF NOT EXISTS pid ON worker TYPE int;
DEFINE FIELD IF NOT EXISTS current_job ON worker TYPE option<string>;
DEFINE FIELD IF NOT EXISTS started_at ON worker TYPE int;
DEFINE FIELD IF NOT EXISTS last_seen ON worker TYPE int;

DEFINE INDEX IF NOT EXISTS worker_pool ON worker FIELDS pool_id;
DEFINE INDEX IF NOT EXISTS worker_seen ON worker FIELDS last_seen;
"#;

/// Single-record queue configuration.
const SETTINGS_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS settings SCHEMAFULL;

DEFINE FIELD IF NOT EXISTS config ON settings FLEXIBLE TYPE object;
DEFINE FIELD IF NOT EXISTS updated_at ON settings TYPE int;
"#;
