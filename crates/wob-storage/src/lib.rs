//! Durable order store: schema guardianship + transactional upserts.

use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tokio::sync::Mutex;
use tracing::debug;
use wob_core::Order;

pub const CRATE_NAME: &str = "wob-storage";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("schema ensure failed: {0}")]
    Schema(#[source] sqlx::Error),
    #[error("order upsert failed, batch of {attempted} rolled back: {source}")]
    Upsert {
        attempted: usize,
        #[source]
        source: sqlx::Error,
    },
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

// Table as originally shipped. Later columns are added by the additive
// migration loop below, never inlined here, so that existing deployments
// and fresh databases converge on the same shape.
const CREATE_ORDERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS orders (
    order_key TEXT PRIMARY KEY CHECK (length(order_key) <= 50),
    numeric_order_id INTEGER,
    order_type_code TEXT,
    order_number TEXT,
    customer_code TEXT,
    customer_name TEXT,
    importer TEXT,
    article TEXT,
    article_description TEXT,
    article_count REAL,
    box_count REAL,
    pallet_count REAL,
    order_date TEXT,
    arrival_date TEXT NOT NULL,
    expected_date TEXT NOT NULL,
    is_realized TEXT,
    order_status TEXT,
    comment TEXT,
    last_synced_at TEXT NOT NULL
)
"#;

/// Columns introduced after the first release, in introduction order.
/// Additive only: nothing is ever dropped or retyped.
const EVOLVED_COLUMNS: &[(&str, &str)] = &[
    ("source_reference", "TEXT"),
    ("source_updated_at", "TEXT"),
    ("scheduled_start", "TEXT"),
    ("original_order_number", "TEXT"),
    ("can_proceed", "INTEGER"),
];

const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_orders_arrival_date ON orders (arrival_date)",
    "CREATE INDEX IF NOT EXISTS idx_orders_expected_date ON orders (expected_date)",
];

const UPSERT_ORDER: &str = r#"
INSERT INTO orders (
    order_key, numeric_order_id, order_type_code, order_number,
    customer_code, customer_name, importer, article, article_description,
    article_count, box_count, pallet_count, order_date, arrival_date,
    expected_date, is_realized, order_status, comment, source_reference,
    source_updated_at, scheduled_start, original_order_number, can_proceed,
    last_synced_at
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
          ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)
ON CONFLICT (order_key) DO UPDATE SET
    numeric_order_id = excluded.numeric_order_id,
    order_type_code = excluded.order_type_code,
    order_number = excluded.order_number,
    customer_code = excluded.customer_code,
    customer_name = excluded.customer_name,
    importer = excluded.importer,
    article = excluded.article,
    article_description = excluded.article_description,
    article_count = excluded.article_count,
    box_count = excluded.box_count,
    pallet_count = excluded.pallet_count,
    order_date = excluded.order_date,
    arrival_date = excluded.arrival_date,
    expected_date = excluded.expected_date,
    is_realized = excluded.is_realized,
    order_status = excluded.order_status,
    comment = excluded.comment,
    source_reference = excluded.source_reference,
    source_updated_at = excluded.source_updated_at,
    scheduled_start = excluded.scheduled_start,
    original_order_number = excluded.original_order_number,
    can_proceed = excluded.can_proceed,
    last_synced_at = excluded.last_synced_at
"#;

/// Destination store for synced orders.
///
/// `ensure_schema` is memoized per store instance: the first caller runs
/// the DDL while concurrent callers wait on the same attempt. A failed
/// attempt leaves the memo unset so the next cycle retries from scratch.
#[derive(Debug)]
pub struct OrderStore {
    pool: SqlitePool,
    ensured: Mutex<bool>,
    ensure_attempts: AtomicU32,
}

impl OrderStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(StoreError::Db)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            ensured: Mutex::new(false),
            ensure_attempts: AtomicU32::new(0),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// How many times the underlying schema mutation actually ran.
    pub fn schema_attempts(&self) -> u32 {
        self.ensure_attempts.load(Ordering::SeqCst)
    }

    /// Idempotently bring the destination schema up to date. Safe to call
    /// every cycle; rapid or concurrent calls share one attempt.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let mut ensured = self.ensured.lock().await;
        if *ensured {
            return Ok(());
        }
        self.ensure_attempts.fetch_add(1, Ordering::SeqCst);
        self.apply_schema().await.map_err(StoreError::Schema)?;
        *ensured = true;
        Ok(())
    }

    async fn apply_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(CREATE_ORDERS_TABLE).execute(&self.pool).await?;

        for (column, column_type) in EVOLVED_COLUMNS {
            if self.column_exists(column).await? {
                continue;
            }
            debug!(column, "adding missing orders column");
            let ddl = format!("ALTER TABLE orders ADD COLUMN {column} {column_type}");
            sqlx::query(&ddl).execute(&self.pool).await?;
        }

        for ddl in CREATE_INDEXES {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn column_exists(&self, column: &str) -> Result<bool, sqlx::Error> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM pragma_table_info('orders') WHERE name = ?1")
                .bind(column)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    /// Merge a batch of normalized orders by `order_key` inside one
    /// transaction. Empty input is a no-op. Any per-row failure rolls the
    /// whole batch back; partial application is forbidden.
    pub async fn upsert_all(&self, orders: &[Order]) -> Result<(), StoreError> {
        if orders.is_empty() {
            return Ok(());
        }
        let attempted = orders.len();
        let wrap = |source: sqlx::Error| StoreError::Upsert { attempted, source };

        let mut tx = self.pool.begin().await.map_err(wrap)?;
        for order in orders {
            sqlx::query(UPSERT_ORDER)
                .bind(&order.order_key)
                .bind(order.numeric_order_id)
                .bind(&order.order_type_code)
                .bind(&order.order_number)
                .bind(&order.customer_code)
                .bind(&order.customer_name)
                .bind(&order.importer)
                .bind(&order.article)
                .bind(&order.article_description)
                .bind(order.article_count)
                .bind(order.box_count)
                .bind(order.pallet_count)
                .bind(order.order_date)
                .bind(order.arrival_date)
                .bind(order.expected_date)
                .bind(&order.is_realized)
                .bind(&order.order_status)
                .bind(&order.comment)
                .bind(&order.source_reference)
                .bind(order.source_updated_at)
                .bind(order.scheduled_start)
                .bind(&order.original_order_number)
                .bind(order.can_proceed)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await
                .map_err(wrap)?;
        }
        tx.commit().await.map_err(wrap)?;
        Ok(())
    }

    pub async fn count_orders(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM orders")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn last_synced_at(
        &self,
        order_key: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let stamp = sqlx::query_scalar("SELECT last_synced_at FROM orders WHERE order_key = ?1")
            .bind(order_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(stamp)
    }

    pub async fn get_order(&self, order_key: &str) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query("SELECT * FROM orders WHERE order_key = ?1")
            .bind(order_key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(order_from_row).transpose().map_err(StoreError::Db)
    }
}

fn order_from_row(row: SqliteRow) -> Result<Order, sqlx::Error> {
    Ok(Order {
        order_key: row.try_get("order_key")?,
        numeric_order_id: row.try_get("numeric_order_id")?,
        order_type_code: row.try_get("order_type_code")?,
        order_number: row.try_get("order_number")?,
        customer_code: row.try_get("customer_code")?,
        customer_name: row.try_get("customer_name")?,
        importer: row.try_get("importer")?,
        article: row.try_get("article")?,
        article_description: row.try_get("article_description")?,
        article_count: row.try_get("article_count")?,
        box_count: row.try_get("box_count")?,
        pallet_count: row.try_get("pallet_count")?,
        order_date: row.try_get("order_date")?,
        arrival_date: row.try_get("arrival_date")?,
        expected_date: row.try_get("expected_date")?,
        is_realized: row.try_get("is_realized")?,
        order_status: row.try_get("order_status")?,
        comment: row.try_get("comment")?,
        source_reference: row.try_get("source_reference")?,
        source_updated_at: row.try_get("source_updated_at")?,
        scheduled_start: row.try_get("scheduled_start")?,
        original_order_number: row.try_get("original_order_number")?,
        can_proceed: row.try_get("can_proceed")?,
    })
}
