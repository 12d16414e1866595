use regex::Regex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::LazyLock;

use crate::config::Limits;
use crate::error::{GateError, Result};
use crate::models::query::{CompiledQuery, Filter, Operator, QueryIntent};

static PLAIN_IDENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]+$").unwrap());

/// 默认聚合 (无 agg 时) 的别名
pub const COUNT_ALIAS: &str = "cnt";

/// 已是聚合表达式的列 (`COUNT(...)` 开头或包含 ` AS `) 原样透传，不做列校验
pub fn is_aggregate_expression(entry: &str) -> bool {
    let upper = entry.trim().to_uppercase();
    upper.starts_with("COUNT(") || upper.contains(" AS ")
}

/// 把结构化意图确定性地编译为单条 SELECT。
///
/// 每个标识符都按传入的列集合 (调用方从 schema 缓存取得) 重新校验；
/// 相同输入总是得到逐字节相同的 SQL。
pub struct QueryBuilder {
    limits: Limits,
}

impl QueryBuilder {
    pub fn new(limits: Limits) -> Self {
        Self { limits }
    }

    pub fn build(&self, intent: &QueryIntent, columns: &[String]) -> Result<CompiledQuery> {
        let table = intent.table.as_str();
        let mut select_list = self.projection(intent, columns)?;

        let where_clause = self.where_clause(table, &intent.filters, columns)?;

        let mut aliases: BTreeSet<String> = BTreeSet::new();
        let mut group_clause = None;
        if !intent.group_by.is_empty() {
            for g in &intent.group_by {
                ensure_column(table, columns, g)?;
            }
            let mut parts: Vec<String> = intent.group_by.clone();
            if intent.agg.is_empty() {
                parts.push(format!("COUNT(*) AS {}", COUNT_ALIAS));
                aliases.insert(COUNT_ALIAS.to_string());
            } else {
                for (alias, source) in &intent.agg {
                    ensure_column(table, columns, source)?;
                    if !PLAIN_IDENT.is_match(alias) {
                        return Err(GateError::InvalidAlias(alias.clone()));
                    }
                    parts.push(format!("SUM({}) AS {}", source, alias));
                    aliases.insert(alias.clone());
                }
            }
            select_list = parts.join(", ");
            group_clause = Some(format!("GROUP BY {}", intent.group_by.join(", ")));
        }

        let mut order_parts = Vec::with_capacity(intent.order_by.len());
        for o in &intent.order_by {
            let col = o.col.trim();
            if col.is_empty() {
                return Err(GateError::MalformedOrderBy("order_by entries must contain col".into()));
            }
            let known = columns.iter().any(|c| c == col) || aliases.contains(col) || col == COUNT_ALIAS;
            if !known {
                return Err(GateError::MalformedOrderBy(format!(
                    "'{}' is neither a column of {} nor an aggregation alias",
                    col, table
                )));
            }
            let dir = match o.dir.trim().to_lowercase().as_str() {
                "asc" => "ASC",
                "desc" => "DESC",
                other => {
                    return Err(GateError::MalformedOrderBy(format!(
                        "direction '{}' must be asc or desc",
                        other
                    )))
                }
            };
            order_parts.push(format!("{} {}", col, dir));
        }

        let limit = self.resolve_limit(intent.limit)?;

        let mut sql = format!("SELECT {} FROM {}", select_list, table);
        if let Some(w) = where_clause {
            sql.push(' ');
            sql.push_str(&w);
        }
        if let Some(g) = group_clause {
            sql.push(' ');
            sql.push_str(&g);
        }
        if !order_parts.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&order_parts.join(", "));
        }
        sql.push_str(&format!(" LIMIT {}", limit));
        Ok(CompiledQuery::new(sql))
    }

    fn projection(&self, intent: &QueryIntent, columns: &[String]) -> Result<String> {
        let selected = match &intent.columns {
            None => return Ok("*".to_string()),
            Some(list) if list.is_empty() => return Ok("*".to_string()),
            Some(list) if list.len() == 1 && list[0].trim() == "*" => return Ok("*".to_string()),
            Some(list) => list,
        };
        let mut safe = Vec::with_capacity(selected.len());
        for c in selected {
            if is_aggregate_expression(c) {
                safe.push(c.trim().to_string());
                continue;
            }
            ensure_column(&intent.table, columns, c)?;
            safe.push(c.clone());
        }
        Ok(safe.join(", "))
    }

    /// 渲染 `WHERE ...`，没有过滤条件时返回 None。报表模板也复用这里
    pub fn where_clause(&self, table: &str, filters: &[Filter], columns: &[String]) -> Result<Option<String>> {
        if filters.is_empty() {
            return Ok(None);
        }
        let fragments = filters
            .iter()
            .map(|f| render_filter(table, f, columns))
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(format!("WHERE {}", fragments.join(" AND "))))
    }

    /// 缺省取默认行数上限；显式给出时须满足 0 < limit <= 单查询上限
    pub fn resolve_limit(&self, limit: Option<i64>) -> Result<i64> {
        match limit {
            None => Ok(self.limits.max_rows_return),
            Some(n) if n > 0 && n <= self.limits.max_limit_per_query => Ok(n),
            Some(n) => Err(GateError::InvalidLimit(n)),
        }
    }
}

fn ensure_column(table: &str, columns: &[String], name: &str) -> Result<()> {
    if columns.iter().any(|c| c == name) {
        Ok(())
    } else {
        Err(GateError::UnresolvedColumn {
            table: table.to_string(),
            token: name.to_string(),
        })
    }
}

fn render_filter(table: &str, filter: &Filter, columns: &[String]) -> Result<String> {
    ensure_column(table, columns, &filter.col)?;
    let op: Operator = filter.op.parse()?;
    let shape_error = |reason: &str| GateError::InvalidFilterValueShape {
        column: filter.col.clone(),
        op: op.to_string(),
        reason: reason.to_string(),
    };

    if op == Operator::In {
        let items = filter
            .val
            .as_array()
            .ok_or_else(|| shape_error("IN operator requires a list value"))?;
        if items.is_empty() {
            return Err(shape_error("IN list must not be empty"));
        }
        let rendered = items
            .iter()
            .map(|v| render_literal(v).ok_or_else(|| shape_error("IN list items must be scalars")))
            .collect::<Result<Vec<_>>>()?;
        return Ok(format!("{} IN ({})", filter.col, rendered.join(", ")));
    }

    let literal =
        render_literal(&filter.val).ok_or_else(|| shape_error("operator requires a scalar value"))?;
    Ok(format!("{} {} {}", filter.col, op.as_sql(), literal))
}

/// 数字与 NULL 原样输出，其余一律加单引号并把内部单引号加倍
fn render_literal(value: &Value) -> Option<String> {
    match value {
        Value::Null => Some("NULL".to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(quote(&b.to_string())),
        Value::String(s) => Some(quote(s)),
        Value::Array(_) | Value::Object(_) => None,
    }
}

fn quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::query::OrderSpec;
    use serde_json::json;

    fn mrr_columns() -> Vec<String> {
        ["year", "month", "region", "subscription_plan", "total_revenue", "avg_revenue_per_user", "mrr"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn builder() -> QueryBuilder {
        QueryBuilder::new(Limits::default())
    }

    fn mrr_by_region() -> QueryIntent {
        let mut intent = QueryIntent::for_table("gold.mrr");
        intent.group_by = vec!["region".into()];
        intent.agg.insert("total_revenue_sum".into(), "total_revenue".into());
        intent.filters = vec![Filter::new("year", Operator::Eq, 2025)];
        intent.order_by = vec![OrderSpec::desc("total_revenue_sum")];
        intent.limit = Some(50);
        intent
    }

    #[test]
    fn grouped_query_renders_every_clause() {
        let sql = builder().build(&mrr_by_region(), &mrr_columns()).unwrap();
        assert_eq!(
            sql.as_str(),
            "SELECT region, SUM(total_revenue) AS total_revenue_sum FROM gold.mrr WHERE year = 2025 \
             GROUP BY region ORDER BY total_revenue_sum DESC LIMIT 50"
        );
    }

    #[test]
    fn compiling_twice_is_byte_identical() {
        let intent = mrr_by_region();
        let a = builder().build(&intent, &mrr_columns()).unwrap();
        let b = builder().build(&intent, &mrr_columns()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn bare_select_defaults_to_star_and_row_cap() {
        let intent = QueryIntent::for_table("gold.mrr");
        let sql = builder().build(&intent, &mrr_columns()).unwrap();
        assert_eq!(sql.as_str(), "SELECT * FROM gold.mrr LIMIT 2000");
    }

    #[test]
    fn group_without_agg_counts_rows() {
        let mut intent = QueryIntent::for_table("gold.mrr");
        intent.group_by = vec!["region".into(), "year".into()];
        intent.order_by = vec![OrderSpec::desc("cnt")];
        intent.limit = Some(10);
        let sql = builder().build(&intent, &mrr_columns()).unwrap();
        assert_eq!(
            sql.as_str(),
            "SELECT region, year, COUNT(*) AS cnt FROM gold.mrr GROUP BY region, year ORDER BY cnt DESC LIMIT 10"
        );
    }

    #[test]
    fn literals_are_escaped_and_in_lists_rendered() {
        let mut intent = QueryIntent::for_table("gold.mrr");
        intent.columns = Some(vec!["region".into(), "COUNT(*) AS cnt".into()]);
        intent.filters = vec![
            Filter::new("region", Operator::In, json!(["de-berlin", "o'hare"])),
            Filter {
                col: "subscription_plan".into(),
                op: "!=".into(),
                val: json!("it's"),
            },
            Filter::new("mrr", Operator::Gte, json!(10.5)),
            Filter::new("month", Operator::Eq, Value::Null),
        ];
        intent.limit = Some(5);
        let sql = builder().build(&intent, &mrr_columns()).unwrap();
        assert_eq!(
            sql.as_str(),
            "SELECT region, COUNT(*) AS cnt FROM gold.mrr WHERE region IN ('de-berlin', 'o''hare') \
             AND subscription_plan <> 'it''s' AND mrr >= 10.5 AND month = NULL LIMIT 5"
        );
    }

    #[test]
    fn unknown_identifiers_fail_validation() {
        let cols = mrr_columns();
        let mut intent = QueryIntent::for_table("gold.mrr");
        intent.columns = Some(vec!["revenue".into()]);
        assert!(matches!(
            builder().build(&intent, &cols),
            Err(GateError::UnresolvedColumn { token, .. }) if token == "revenue"
        ));

        let mut intent = mrr_by_region();
        intent.agg.insert("bad alias".into(), "mrr".into());
        assert_eq!(
            builder().build(&intent, &cols),
            Err(GateError::InvalidAlias("bad alias".into()))
        );

        let mut intent = mrr_by_region();
        intent.order_by = vec![OrderSpec::desc("revenue_total")];
        assert!(matches!(builder().build(&intent, &cols), Err(GateError::MalformedOrderBy(_))));

        let mut intent = mrr_by_region();
        intent.order_by = vec![OrderSpec {
            col: "region".into(),
            dir: "sideways".into(),
        }];
        assert!(matches!(builder().build(&intent, &cols), Err(GateError::MalformedOrderBy(_))));
    }

    #[test]
    fn filter_shape_and_operator_checks() {
        let cols = mrr_columns();
        let mut intent = QueryIntent::for_table("gold.mrr");
        intent.filters = vec![Filter::new("region", Operator::In, "de-berlin")];
        assert!(matches!(
            builder().build(&intent, &cols),
            Err(GateError::InvalidFilterValueShape { .. })
        ));

        intent.filters = vec![Filter::new("region", Operator::Eq, json!(["a"]))];
        assert!(matches!(
            builder().build(&intent, &cols),
            Err(GateError::InvalidFilterValueShape { .. })
        ));

        intent.filters = vec![Filter {
            col: "region".into(),
            op: "regexp".into(),
            val: json!("x"),
        }];
        assert_eq!(
            builder().build(&intent, &cols),
            Err(GateError::InvalidOperator("regexp".into()))
        );
    }

    #[test]
    fn limit_bounds() {
        let cols = mrr_columns();
        let mut intent = QueryIntent::for_table("gold.mrr");
        for bad in [0, -3, 5001] {
            intent.limit = Some(bad);
            assert_eq!(builder().build(&intent, &cols), Err(GateError::InvalidLimit(bad)));
        }
        intent.limit = Some(5000);
        assert!(builder().build(&intent, &cols).unwrap().as_str().ends_with("LIMIT 5000"));
    }

    #[test]
    fn output_is_one_select_statement() {
        let sql = builder().build(&mrr_by_region(), &mrr_columns()).unwrap();
        let upper = sql.as_str().to_uppercase();
        assert!(upper.starts_with("SELECT "));
        assert_eq!(upper.matches("SELECT").count(), 1);
        assert!(!sql.as_str().contains(';'));
    }
}
