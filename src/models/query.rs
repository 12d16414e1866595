use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::GateError;

/// 过滤条件操作符
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Gt,
    Lte,
    Gte,
    Like,
    In,
}

impl Operator {
    /// 渲染到 SQL 的形式 (`!=` 与 `<>` 统一为 `<>`)
    pub fn as_sql(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "<>",
            Operator::Lt => "<",
            Operator::Gt => ">",
            Operator::Lte => "<=",
            Operator::Gte => ">=",
            Operator::Like => "LIKE",
            Operator::In => "IN",
        }
    }
}

impl FromStr for Operator {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "=" | "==" => Ok(Operator::Eq),
            "!=" | "<>" => Ok(Operator::Ne),
            "<" => Ok(Operator::Lt),
            ">" => Ok(Operator::Gt),
            "<=" => Ok(Operator::Lte),
            ">=" => Ok(Operator::Gte),
            "like" => Ok(Operator::Like),
            "in" => Ok(Operator::In),
            other => Err(GateError::InvalidOperator(other.to_string())),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

fn default_op() -> String {
    "=".to_string()
}

fn default_dir() -> String {
    "desc".to_string()
}

/// 载荷中的过滤条件，操作符保留原始字符串，由构建器统一校验
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub col: String,
    #[serde(default = "default_op")]
    pub op: String,
    #[serde(default)]
    pub val: Value,
}

impl Filter {
    pub fn new(col: impl Into<String>, op: Operator, val: impl Into<Value>) -> Self {
        Self {
            col: col.into(),
            op: op.as_sql().to_lowercase(),
            val: val.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSpec {
    pub col: String,
    #[serde(default = "default_dir")]
    pub dir: String,
}

impl OrderSpec {
    pub fn desc(col: impl Into<String>) -> Self {
        Self {
            col: col.into(),
            dir: "desc".to_string(),
        }
    }
}

/// 规范化的结构化查询意图：请求与 SQL 之间唯一的中间表示
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryIntent {
    #[serde(default)]
    pub table: String,
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub filters: Vec<Filter>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub group_by: Vec<String>,
    /// 结果别名 -> 源列，隐含 `SUM(源列) AS 别名`
    #[serde(default, deserialize_with = "null_as_default")]
    pub agg: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub order_by: Vec<OrderSpec>,
    #[serde(default)]
    pub limit: Option<i64>,
}

impl QueryIntent {
    pub fn for_table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }
}

// LLM 经常把空字段写成 null
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// 已编译的单条 SELECT 语句，构建后不可变
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CompiledQuery(String);

impl CompiledQuery {
    pub(crate) fn new(sql: String) -> Self {
        Self(sql)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CompiledQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn operator_parsing_is_case_insensitive() {
        assert_eq!("LIKE".parse::<Operator>().unwrap(), Operator::Like);
        assert_eq!("==".parse::<Operator>().unwrap(), Operator::Eq);
        assert_eq!("!=".parse::<Operator>().unwrap().as_sql(), "<>");
        assert!(matches!(
            "between".parse::<Operator>(),
            Err(GateError::InvalidOperator(op)) if op == "between"
        ));
    }

    #[test]
    fn payload_tolerates_nulls_and_missing_fields() {
        let raw = json!({
            "table": "gold.mrr",
            "columns": null,
            "filters": [{"col": "year", "op": "=", "val": 2025}],
            "group_by": ["region"],
            "agg": {"total_revenue_sum": "total_revenue"},
            "order_by": [{"col": "total_revenue_sum"}],
            "limit": 50
        });
        let intent: QueryIntent = serde_json::from_value(raw).unwrap();
        assert_eq!(intent.columns, None);
        assert_eq!(intent.order_by[0].dir, "desc");
        assert_eq!(intent.limit, Some(50));

        let sparse: QueryIntent =
            serde_json::from_value(json!({"table": "gold.ltv", "filters": null})).unwrap();
        assert!(sparse.filters.is_empty());
        assert!(sparse.agg.is_empty());
        assert_eq!(sparse.limit, None);
    }
}
