use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use sqlx::mysql::MySqlRow;
use sqlx::postgres::PgRow;
use sqlx::{Column, Row, TypeInfo};

use crate::models::context::QueryResult;

/// 指标列以数值返回，精度损失可接受
fn decimal_value(v: Option<Decimal>) -> Value {
    json!(v.and_then(|d| d.to_f64()))
}

fn pg_cell(row: &PgRow, idx: usize, type_name: &str) -> Value {
    match type_name {
        "INT2" => json!(row.try_get::<Option<i16>, _>(idx).unwrap_or(None)),
        "INT4" => json!(row.try_get::<Option<i32>, _>(idx).unwrap_or(None)),
        "INT8" => json!(row.try_get::<Option<i64>, _>(idx).unwrap_or(None)),
        "FLOAT4" => json!(row.try_get::<Option<f32>, _>(idx).unwrap_or(None)),
        "FLOAT8" => json!(row.try_get::<Option<f64>, _>(idx).unwrap_or(None)),
        "NUMERIC" => decimal_value(row.try_get(idx).unwrap_or(None)),
        "BOOL" => json!(row.try_get::<Option<bool>, _>(idx).unwrap_or(None)),
        "DATE" => json!(row
            .try_get::<Option<NaiveDate>, _>(idx)
            .unwrap_or(None)
            .map(|d| d.to_string())),
        "TIMESTAMP" => json!(row
            .try_get::<Option<NaiveDateTime>, _>(idx)
            .unwrap_or(None)
            .map(|dt| dt.to_string())),
        "TIMESTAMPTZ" => json!(row
            .try_get::<Option<DateTime<Utc>>, _>(idx)
            .unwrap_or(None)
            .map(|dt| dt.to_rfc3339())),
        "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(idx).unwrap_or(None).unwrap_or(Value::Null),
        // TEXT / VARCHAR / BPCHAR / NAME 以及其它未知类型按字符串读
        _ => json!(row.try_get::<Option<String>, _>(idx).unwrap_or(None)),
    }
}

fn mysql_cell(row: &MySqlRow, idx: usize, type_name: &str) -> Value {
    match type_name {
        "TINYINT" | "SMALLINT" | "INT" | "MEDIUMINT" => {
            json!(row.try_get::<Option<i32>, _>(idx).unwrap_or(None))
        }
        "BIGINT" => json!(row.try_get::<Option<i64>, _>(idx).unwrap_or(None)),
        "FLOAT" | "DOUBLE" => json!(row.try_get::<Option<f64>, _>(idx).unwrap_or(None)),
        "DECIMAL" => decimal_value(row.try_get(idx).unwrap_or(None)),
        "BOOLEAN" => json!(row.try_get::<Option<bool>, _>(idx).unwrap_or(None)),
        "DATE" => json!(row
            .try_get::<Option<NaiveDate>, _>(idx)
            .unwrap_or(None)
            .map(|d| d.to_string())),
        "DATETIME" | "TIMESTAMP" => json!(row
            .try_get::<Option<NaiveDateTime>, _>(idx)
            .unwrap_or(None)
            .map(|dt| dt.to_string())),
        "JSON" => row.try_get::<Option<Value>, _>(idx).unwrap_or(None).unwrap_or(Value::Null),
        _ => json!(row.try_get::<Option<String>, _>(idx).unwrap_or(None)),
    }
}

/// 结果集转 JSON；列顺序取自第一行，空结果没有列信息
pub fn pg_rows_to_result(rows: &[PgRow]) -> QueryResult {
    let columns = rows
        .first()
        .map(|r| r.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();
    let rows = rows
        .iter()
        .map(|row| {
            let mut map = Map::new();
            for (idx, col) in row.columns().iter().enumerate() {
                map.insert(col.name().to_string(), pg_cell(row, idx, col.type_info().name()));
            }
            Value::Object(map)
        })
        .collect();
    QueryResult { columns, rows }
}

pub fn mysql_rows_to_result(rows: &[MySqlRow]) -> QueryResult {
    let columns = rows
        .first()
        .map(|r| r.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();
    let rows = rows
        .iter()
        .map(|row| {
            let mut map = Map::new();
            for (idx, col) in row.columns().iter().enumerate() {
                map.insert(col.name().to_string(), mysql_cell(row, idx, col.type_info().name()));
            }
            Value::Object(map)
        })
        .collect();
    QueryResult { columns, rows }
}
