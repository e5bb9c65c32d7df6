//! Warehouse source contracts + the Postgres-backed implementation.
//!
//! The sync pipeline talks to the external warehouse through the
//! [`OrderSource`] trait so that fetch semantics (ad-hoc query first,
//! stored-procedure fallback) stay testable without a live warehouse.

use async_trait::async_trait;
use bigdecimal::ToPrimitive;
use serde_json::{Number as JsonNumber, Value as JsonValue};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Row, TypeInfo};
use tracing::warn;
use wob_core::RawRecord;

pub const CRATE_NAME: &str = "wob-adapters";

/// Default set-returning procedure invoked when no ad-hoc query is
/// configured (or when the configured query target is missing).
pub const DEFAULT_PROCEDURE: &str = "pending_orders_feed";

/// Default value of the procedure's single flag parameter. The flag is a
/// warehouse-defined document/non-document distinguisher.
pub const DEFAULT_DOCUMENT_FLAG: &str = "D";

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The query or procedure target does not exist in the warehouse.
    /// Recoverable: the fetcher falls back to the fixed procedure.
    #[error("source object missing: {detail}")]
    MissingObject { detail: String },
    #[error("warehouse source failure: {0}")]
    Backend(#[from] sqlx::Error),
}

/// How one fetch should be performed, from operator configuration.
#[derive(Debug, Clone)]
pub struct FetchPlan {
    /// Optional operator-supplied SQL, tried before the procedure.
    pub adhoc_query: Option<String>,
    pub procedure: String,
    pub document_flag: String,
}

impl Default for FetchPlan {
    fn default() -> Self {
        Self {
            adhoc_query: None,
            procedure: DEFAULT_PROCEDURE.to_string(),
            document_flag: DEFAULT_DOCUMENT_FLAG.to_string(),
        }
    }
}

/// Read-only handle on the external warehouse.
#[async_trait]
pub trait OrderSource: Send + Sync {
    async fn run_query(&self, sql: &str) -> Result<Vec<RawRecord>, SourceError>;

    async fn call_procedure(
        &self,
        procedure: &str,
        document_flag: &str,
    ) -> Result<Vec<RawRecord>, SourceError>;
}

/// Fetch the pending-order row set described by `plan`.
///
/// A configured, non-blank ad-hoc query runs first. If its target does
/// not exist the fetch falls back to the fixed procedure once, with a
/// warning; every other query failure aborts the fetch. Without an
/// ad-hoc query the procedure is called directly.
pub async fn fetch_raw_orders(
    source: &dyn OrderSource,
    plan: &FetchPlan,
) -> Result<Vec<RawRecord>, SourceError> {
    if let Some(query) = plan
        .adhoc_query
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
    {
        match source.run_query(query).await {
            Ok(rows) => return Ok(rows),
            Err(SourceError::MissingObject { detail }) => {
                warn!(
                    procedure = %plan.procedure,
                    %detail,
                    "ad-hoc order query target missing, falling back to procedure"
                );
            }
            Err(other) => return Err(other),
        }
    }
    source
        .call_procedure(&plan.procedure, &plan.document_flag)
        .await
}

/// Postgres-backed warehouse source. Rows are decoded column-by-column
/// into loosely-typed [`RawRecord`]s; the normalizer downstream deals
/// with whatever shape the warehouse exposes.
#[derive(Debug, Clone)]
pub struct PgWarehouseSource {
    pool: PgPool,
}

impl PgWarehouseSource {
    pub async fn connect(url: &str) -> Result<Self, SourceError> {
        let pool = PgPoolOptions::new().max_connections(2).connect(url).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderSource for PgWarehouseSource {
    async fn run_query(&self, sql: &str) -> Result<Vec<RawRecord>, SourceError> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(classify_sqlx)?;
        Ok(rows.iter().map(pg_row_to_record).collect())
    }

    async fn call_procedure(
        &self,
        procedure: &str,
        document_flag: &str,
    ) -> Result<Vec<RawRecord>, SourceError> {
        // The procedure name comes from operator configuration, not from
        // source data, so interpolating the quoted identifier is acceptable.
        let sql = format!("SELECT * FROM \"{procedure}\"($1)");
        let rows = sqlx::query(&sql)
            .bind(document_flag)
            .fetch_all(&self.pool)
            .await
            .map_err(classify_sqlx)?;
        Ok(rows.iter().map(pg_row_to_record).collect())
    }
}

/// Map "target does not exist" SQLSTATEs onto [`SourceError::MissingObject`].
///
/// 42P01 is undefined_table, 42883 undefined_function. The codes are
/// Postgres-specific; a different warehouse backend supplies its own
/// classifier behind [`OrderSource`].
fn classify_sqlx(err: sqlx::Error) -> SourceError {
    if let sqlx::Error::Database(db) = &err {
        if matches!(db.code().as_deref(), Some("42P01" | "42883")) {
            return SourceError::MissingObject {
                detail: db.message().to_string(),
            };
        }
    }
    SourceError::Backend(err)
}

fn json_from_f64(value: f64) -> JsonValue {
    JsonNumber::from_f64(value)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

/// Decode a Postgres row into a string-keyed JSON map by column type.
/// Unknown or undecodable column types become `Null` rather than
/// failing the fetch; the normalizer treats `Null` as absent.
fn pg_row_to_record(row: &PgRow) -> RawRecord {
    let mut record = RawRecord::new();
    for column in row.columns() {
        let idx = column.ordinal();
        let value = match column.type_info().name() {
            "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" => row
                .try_get::<Option<String>, _>(idx)
                .unwrap_or(None)
                .map(JsonValue::String),
            "INT2" => row
                .try_get::<Option<i16>, _>(idx)
                .unwrap_or(None)
                .map(|v| JsonValue::from(i64::from(v))),
            "INT4" => row
                .try_get::<Option<i32>, _>(idx)
                .unwrap_or(None)
                .map(|v| JsonValue::from(i64::from(v))),
            "INT8" => row
                .try_get::<Option<i64>, _>(idx)
                .unwrap_or(None)
                .map(JsonValue::from),
            "FLOAT4" => row
                .try_get::<Option<f32>, _>(idx)
                .unwrap_or(None)
                .map(|v| json_from_f64(f64::from(v))),
            "FLOAT8" => row
                .try_get::<Option<f64>, _>(idx)
                .unwrap_or(None)
                .map(json_from_f64),
            "NUMERIC" => row
                .try_get::<Option<sqlx::types::BigDecimal>, _>(idx)
                .unwrap_or(None)
                .and_then(|v| v.to_f64())
                .map(json_from_f64),
            "BOOL" => row
                .try_get::<Option<bool>, _>(idx)
                .unwrap_or(None)
                .map(JsonValue::Bool),
            "UUID" => row
                .try_get::<Option<uuid::Uuid>, _>(idx)
                .unwrap_or(None)
                .map(|v| JsonValue::String(v.to_string())),
            "DATE" => row
                .try_get::<Option<chrono::NaiveDate>, _>(idx)
                .unwrap_or(None)
                .map(|v| JsonValue::String(v.to_string())),
            "TIMESTAMP" => row
                .try_get::<Option<chrono::NaiveDateTime>, _>(idx)
                .unwrap_or(None)
                .map(|v| JsonValue::String(v.to_string())),
            "TIMESTAMPTZ" => row
                .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx)
                .unwrap_or(None)
                .map(|v| JsonValue::String(v.to_rfc3339())),
            _ => None,
        };
        record.insert(column.name().to_string(), value.unwrap_or(JsonValue::Null));
    }
    record
}
