//! Durable append-only sink for request lifecycle records, grounded on the
//! SQLite + r2d2 pooling pattern used for `aspy`'s lifetime-statistics
//! store.

use std::path::Path;

use anyhow::{Context, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;

use super::RequestRecord;

pub type SinkPool = Pool<SqliteConnectionManager>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS request_logs (
    request_id TEXT PRIMARY KEY,
    start_time INTEGER NOT NULL,
    end_time INTEGER,
    status TEXT NOT NULL,
    model_name TEXT,
    endpoint_name TEXT,
    group_name TEXT,
    client_ip TEXT,
    user_agent TEXT,
    method TEXT NOT NULL,
    path TEXT NOT NULL,
    http_status_code INTEGER,
    retry_count INTEGER NOT NULL DEFAULT 0,
    duration_ms INTEGER,
    is_streaming INTEGER NOT NULL DEFAULT 0,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    cache_creation_tokens INTEGER NOT NULL DEFAULT 0,
    cache_read_tokens INTEGER NOT NULL DEFAULT 0,
    input_cost REAL NOT NULL DEFAULT 0,
    output_cost REAL NOT NULL DEFAULT 0,
    cache_creation_cost REAL NOT NULL DEFAULT 0,
    cache_read_cost REAL NOT NULL DEFAULT 0,
    total_cost REAL NOT NULL DEFAULT 0,
    failure_reason TEXT,
    cancel_reason TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_request_logs_start_time ON request_logs(start_time);
CREATE INDEX IF NOT EXISTS idx_request_logs_status_start_time ON request_logs(status, start_time);
"#;

pub fn open_pool(path: &Path) -> Result<SinkPool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating sink directory {}", parent.display()))?;
    }
    let manager = SqliteConnectionManager::file(path).with_init(|conn| {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
    });
    let pool = Pool::builder()
        .max_size(4)
        .build(manager)
        .context("building sqlite connection pool")?;
    pool.get()
        .context("acquiring sqlite connection for schema init")?
        .execute_batch(SCHEMA)
        .context("creating request_logs schema")?;
    Ok(pool)
}

/// Upserts one batch of records in a single transaction. `request_id` is the
/// uniqueness key: a second write for the same id updates the row in place
/// rather than appending a duplicate, which is how the "last full usage
/// object wins" rule stays true even after a sink flush.
pub fn upsert_batch(pool: &SinkPool, records: &[RequestRecord]) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }
    let mut conn = pool.get().context("acquiring sqlite connection")?;
    let tx = conn.transaction().context("beginning sink transaction")?;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO request_logs (
                request_id, start_time, end_time, status, model_name, endpoint_name,
                group_name, client_ip, user_agent, method, path, http_status_code,
                retry_count, duration_ms, is_streaming, input_tokens, output_tokens,
                cache_creation_tokens, cache_read_tokens, input_cost, output_cost,
                cache_creation_cost, cache_read_cost, total_cost, failure_reason,
                cancel_reason, created_at, updated_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28
            )
            ON CONFLICT(request_id) DO UPDATE SET
                end_time = excluded.end_time,
                status = excluded.status,
                model_name = excluded.model_name,
                endpoint_name = excluded.endpoint_name,
                group_name = excluded.group_name,
                http_status_code = excluded.http_status_code,
                retry_count = excluded.retry_count,
                duration_ms = excluded.duration_ms,
                input_tokens = excluded.input_tokens,
                output_tokens = excluded.output_tokens,
                cache_creation_tokens = excluded.cache_creation_tokens,
                cache_read_tokens = excluded.cache_read_tokens,
                input_cost = excluded.input_cost,
                output_cost = excluded.output_cost,
                cache_creation_cost = excluded.cache_creation_cost,
                cache_read_cost = excluded.cache_read_cost,
                total_cost = excluded.total_cost,
                failure_reason = excluded.failure_reason,
                cancel_reason = excluded.cancel_reason,
                updated_at = excluded.updated_at",
        )?;
        for r in records {
            stmt.execute(params![
                r.request_id,
                r.start_time_ms,
                r.end_time_ms,
                r.status.as_str(),
                r.model,
                r.endpoint,
                r.group,
                r.client_ip,
                r.user_agent,
                r.method,
                r.path,
                r.http_status_code,
                r.retry_count,
                r.duration_ms,
                r.is_streaming as i64,
                r.usage.input_tokens as i64,
                r.usage.output_tokens as i64,
                r.usage.cache_creation_tokens as i64,
                r.usage.cache_read_tokens as i64,
                r.cost.input_cost,
                r.cost.output_cost,
                r.cost.cache_creation_cost,
                r.cost.cache_read_cost,
                r.cost.total(),
                r.failure_reason,
                r.cancel_reason,
                r.created_at_ms,
                r.updated_at_ms,
            ])?;
        }
    }
    tx.commit().context("committing sink transaction")?;
    Ok(())
}

/// Filter/sort/paginate surface backing `GET /api/v1/usage/requests`.
#[derive(Debug, Default, Clone)]
pub struct UsageQuery {
    pub start_date_ms: Option<i64>,
    pub end_date_ms: Option<i64>,
    pub status: Option<String>,
    pub model: Option<String>,
    pub endpoint: Option<String>,
    pub group: Option<String>,
    pub page: u32,
    pub page_size: u32,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct UsageRow {
    pub request_id: String,
    pub start_time_ms: i64,
    pub end_time_ms: Option<i64>,
    pub status: String,
    pub model: Option<String>,
    pub endpoint: Option<String>,
    pub group: Option<String>,
    pub http_status_code: Option<i64>,
    pub retry_count: i64,
    pub duration_ms: Option<i64>,
    pub total_cost: f64,
}

/// `sort_by=start_time desc` is enforced, not a query option.
pub fn query_requests(pool: &SinkPool, q: &UsageQuery) -> Result<Vec<UsageRow>> {
    let conn = pool.get().context("acquiring sqlite connection")?;
    let mut sql = String::from(
        "SELECT request_id, start_time, end_time, status, model_name, endpoint_name,
                group_name, http_status_code, retry_count, duration_ms, total_cost
         FROM request_logs WHERE 1=1",
    );
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(v) = q.start_date_ms {
        sql.push_str(" AND start_time >= ?");
        params.push(Box::new(v));
    }
    if let Some(v) = q.end_date_ms {
        sql.push_str(" AND start_time <= ?");
        params.push(Box::new(v));
    }
    if let Some(v) = &q.status {
        sql.push_str(" AND status = ?");
        params.push(Box::new(v.clone()));
    }
    if let Some(v) = &q.model {
        sql.push_str(" AND model_name = ?");
        params.push(Box::new(v.clone()));
    }
    if let Some(v) = &q.endpoint {
        sql.push_str(" AND endpoint_name = ?");
        params.push(Box::new(v.clone()));
    }
    if let Some(v) = &q.group {
        sql.push_str(" AND group_name = ?");
        params.push(Box::new(v.clone()));
    }
    sql.push_str(" ORDER BY start_time DESC LIMIT ? OFFSET ?");
    let page_size = q.page_size.max(1) as i64;
    let offset = (q.page.saturating_sub(1) as i64) * page_size;
    params.push(Box::new(page_size));
    params.push(Box::new(offset));

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let rows = stmt.query_map(param_refs.as_slice(), |row| {
        Ok(UsageRow {
            request_id: row.get(0)?,
            start_time_ms: row.get(1)?,
            end_time_ms: row.get(2)?,
            status: row.get(3)?,
            model: row.get(4)?,
            endpoint: row.get(5)?,
            group: row.get(6)?,
            http_status_code: row.get(7)?,
            retry_count: row.get(8)?,
            duration_ms: row.get(9)?,
            total_cost: row.get(10)?,
        })
    })?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("reading request_logs row")?);
    }
    Ok(out)
}

/// Distinct-value lists for operator UI filters
/// (`/api/v1/usage/models|endpoints|groups`).
pub fn distinct_values(pool: &SinkPool, column: &str) -> Result<Vec<String>> {
    let allowed = matches!(column, "model_name" | "endpoint_name" | "group_name");
    anyhow::ensure!(allowed, "unsupported distinct-value column: {column}");
    let conn = pool.get().context("acquiring sqlite connection")?;
    let sql = format!(
        "SELECT DISTINCT {column} FROM request_logs WHERE {column} IS NOT NULL ORDER BY {column}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
