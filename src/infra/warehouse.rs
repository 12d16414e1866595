use anyhow::Context;
use async_trait::async_trait;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::postgres::PgPoolOptions;
use sqlx::{MySql, Pool, Postgres, Row};
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::core::schema_cache::ColumnFetcher;
use crate::error::GateError;
use crate::infra::rows::{mysql_rows_to_result, pg_rows_to_result};
use crate::models::context::QueryResult;
use crate::models::query::CompiledQuery;

pub enum DynamicPool {
    Postgres(Pool<Postgres>),
    MySql(Pool<MySql>),
}

/// 数仓连接。只执行已过安全闸门的 `CompiledQuery`
pub struct Warehouse {
    pool: DynamicPool,
    timeout: Duration,
}

const PG_COLUMNS: &str = "SELECT column_name::text FROM information_schema.columns \
                          WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position";
const MYSQL_COLUMNS: &str = "SELECT CAST(column_name AS CHAR) FROM information_schema.columns \
                             WHERE table_schema = ? AND table_name = ? ORDER BY ordinal_position";

impl Warehouse {
    /// 按 URL scheme 选择驱动
    pub async fn connect(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let scheme = url.split("://").next().unwrap_or_default().to_lowercase();
        let pool = match scheme.as_str() {
            "postgres" | "postgresql" => {
                let pool = PgPoolOptions::new()
                    .max_connections(5)
                    .connect(url)
                    .await
                    .context("连接 Postgres 数仓失败")?;
                DynamicPool::Postgres(pool)
            }
            "mysql" => {
                let pool = MySqlPoolOptions::new()
                    .max_connections(5)
                    .connect(url)
                    .await
                    .context("连接 MySQL 数仓失败")?;
                DynamicPool::MySql(pool)
            }
            other => anyhow::bail!("unsupported warehouse scheme: {}", other),
        };
        info!("数仓连接已建立 ({})", scheme);
        Ok(Self { pool, timeout })
    }

    #[instrument(skip(self, sql), fields(sql = %sql))]
    pub async fn execute(&self, sql: &CompiledQuery) -> Result<QueryResult, GateError> {
        let run = async {
            match &self.pool {
                DynamicPool::Postgres(p) => sqlx::query(sql.as_str())
                    .fetch_all(p)
                    .await
                    .map(|rows| pg_rows_to_result(&rows)),
                DynamicPool::MySql(p) => sqlx::query(sql.as_str())
                    .fetch_all(p)
                    .await
                    .map(|rows| mysql_rows_to_result(&rows)),
            }
        };
        let result = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| GateError::Execution(format!("query timed out after {}s", self.timeout.as_secs())))?
            .map_err(|e| GateError::Execution(e.to_string()))?;
        debug!("查询返回 {} 行", result.rows.len());
        Ok(result)
    }
}

#[async_trait]
impl ColumnFetcher for Warehouse {
    async fn fetch_columns(&self, table: &str) -> anyhow::Result<Vec<String>> {
        let (schema, name) = table
            .split_once('.')
            .with_context(|| format!("table '{}' is not schema-qualified", table))?;
        let rows = match &self.pool {
            DynamicPool::Postgres(p) => sqlx::query(PG_COLUMNS)
                .bind(schema)
                .bind(name)
                .fetch_all(p)
                .await?
                .into_iter()
                .filter_map(|r| r.try_get::<String, _>(0).ok())
                .collect::<Vec<_>>(),
            DynamicPool::MySql(p) => sqlx::query(MYSQL_COLUMNS)
                .bind(schema)
                .bind(name)
                .fetch_all(p)
                .await?
                .into_iter()
                .filter_map(|r| r.try_get::<String, _>(0).ok())
                .collect::<Vec<_>>(),
        };
        if rows.is_empty() {
            anyhow::bail!("no columns found for {}", table);
        }
        Ok(rows)
    }
}
