//! 载荷组装：把意图与抽取结果按表策略记录拼成规范的 `QueryIntent`。
//!
//! 文本路径尽力而为，规则分支缺字段时退化为投影；外部 (LLM) 载荷逐字段解析，
//! 任何字段解析失败都是硬错误。

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use crate::config::Limits;
use crate::core::alias::TableContext;
use crate::core::builder::{is_aggregate_expression, COUNT_ALIAS};
use crate::core::intent::{
    self, DateEvidence, IntentKind, LimitEvidence, RegionSource, TableSource,
};
use crate::core::profiles::{Vocabulary, COHORT_TABLE};
use crate::error::{GateError, Result};
use crate::models::query::{Filter, Operator, OrderSpec, QueryIntent};

const PROJECTION_PREFERENCE: [&str; 7] = ["feature", "users", "amount", "region", "year", "month", "active_users"];
const PROJECTION_WIDTH: usize = 6;

/// 实际生效的构造规则
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeRule {
    ByDimension,
    Topk,
    Trend,
    Count,
    Cohort,
    Projection,
    /// 规则分支缺少可解析字段，退化为投影
    FallbackProjection,
}

/// 选表结果，在拉取列之前确定
#[derive(Debug, Clone, PartialEq)]
pub struct TableChoice {
    pub table: String,
    pub source: TableSource,
    pub kind: IntentKind,
    pub score: f64,
}

pub fn choose_table(vocab: &Vocabulary, text: &str, default_table: &str) -> TableChoice {
    let (kind, score) = intent::classify(text);
    let (table, source) = if kind == IntentKind::Cohort {
        (COHORT_TABLE.to_string(), TableSource::ForcedCohort)
    } else {
        intent::pick_table(vocab, text, default_table)
    };
    TableChoice {
        table,
        source,
        kind,
        score,
    }
}

/// 每条抽取证据与其来源路径
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssemblyTrace {
    pub intent: IntentKind,
    pub score: f64,
    pub table: TableSource,
    pub limit: LimitEvidence,
    pub date: Option<DateEvidence>,
    pub region: Option<RegionSource>,
    pub plan: Option<String>,
    /// 解析成功的 "by" 维度
    pub dimensions: Vec<String>,
    pub shape: ShapeRule,
}

#[derive(Debug, Clone)]
pub struct Assembly {
    pub intent: QueryIntent,
    pub trace: AssemblyTrace,
}

/// 文本路径组装。`ctx` 必须是 `choice.table` 的上下文
pub fn assemble(
    ctx: &TableContext<'_>,
    vocab: &Vocabulary,
    limits: &Limits,
    text: &str,
    choice: &TableChoice,
    today: NaiveDate,
) -> Assembly {
    let profile = ctx.profile;
    let mut payload = QueryIntent::for_table(ctx.table());

    let dimensions = resolve_dimensions(ctx, text);
    let mut shape = None;
    if !dimensions.is_empty() {
        payload.group_by = dimensions.clone();
        match ctx.resolve_first(profile.by_metric) {
            Some(metric) => set_sum(&mut payload, &metric),
            None => payload.order_by = vec![OrderSpec::desc(COUNT_ALIAS)],
        }
        shape = Some(ShapeRule::ByDimension);
    }

    let mut limit = intent::extract_limit(text, limits);

    match choice.kind {
        IntentKind::Topk => {
            let rule = profile.topk.and_then(|rule| {
                let metric = ctx.resolve_first(rule.metric)?;
                let group = if payload.group_by.is_empty() {
                    vec![ctx.resolve_first(rule.group)?]
                } else {
                    payload.group_by.clone()
                };
                Some((group, metric))
            });
            match rule {
                Some((group, metric)) => {
                    payload.group_by = group;
                    payload.agg.clear();
                    set_sum(&mut payload, &metric);
                    shape = Some(ShapeRule::Topk);
                }
                None => debug!("top-k 规则在 {} 上无法解析，保持现有形状", ctx.table()),
            }
        }
        IntentKind::Trend | IntentKind::Cohort => {
            let axes: Vec<String> = profile
                .trend_axes
                .iter()
                .filter_map(|a| ctx.resolve(a))
                .collect();
            if axes.is_empty() {
                debug!("{} 没有可用的时间轴列", ctx.table());
            } else {
                let recency: Vec<OrderSpec> = axes.iter().map(|a| OrderSpec::desc(a.as_str())).collect();
                payload.group_by = axes;
                payload.agg.clear();
                if let Some(metric) = ctx.resolve_first(profile.trend_metric) {
                    payload.agg.insert(sum_alias(&metric), metric);
                }
                payload.order_by = recency;
                shape = Some(if choice.kind == IntentKind::Cohort {
                    ShapeRule::Cohort
                } else {
                    ShapeRule::Trend
                });
            }
        }
        IntentKind::Count if payload.group_by.is_empty() => {
            let expr = match profile.count_metric.and_then(|m| ctx.resolve(m)) {
                Some(col) => format!("SUM({}) AS user_count", col),
                None => format!("COUNT(*) AS {}", COUNT_ALIAS),
            };
            payload.columns = Some(vec![expr]);
            limit = LimitEvidence { value: 1, ..limit };
            shape = Some(ShapeRule::Count);
        }
        _ => {}
    }

    let shape = match shape {
        Some(s) => s,
        None => {
            payload.columns = Some(projection(ctx));
            if matches!(choice.kind, IntentKind::Select | IntentKind::Aggregate | IntentKind::Count) {
                ShapeRule::Projection
            } else {
                debug!("{:?} 规则未命中，退化为投影", choice.kind);
                ShapeRule::FallbackProjection
            }
        }
    };

    let evidence = intent::extract_filters(ctx, vocab, text, today);
    payload.filters = evidence.filters;
    payload.limit = Some(limit.value);

    Assembly {
        intent: payload,
        trace: AssemblyTrace {
            intent: choice.kind,
            score: choice.score,
            table: choice.source.clone(),
            limit,
            date: evidence.date,
            region: evidence.region,
            plan: evidence.plan,
            dimensions,
            shape,
        },
    }
}

fn sum_alias(metric: &str) -> String {
    format!("{}_sum", metric)
}

fn set_sum(payload: &mut QueryIntent, metric: &str) {
    let alias = sum_alias(metric);
    payload.agg.insert(alias.clone(), metric.to_string());
    payload.order_by = vec![OrderSpec::desc(alias)];
}

/// "by X" 依次尝试 X 与复数形式 Xs，去重保持原文顺序
fn resolve_dimensions(ctx: &TableContext<'_>, text: &str) -> Vec<String> {
    let mut dims: Vec<String> = Vec::new();
    for token in intent::extract_by_dimensions(text) {
        let plural = format!("{}s", token);
        match ctx.resolve_first(&[token.as_str(), plural.as_str()]) {
            Some(col) if !dims.contains(&col) => dims.push(col),
            Some(_) => {}
            None => debug!("by 维度未解析，忽略: {}", token),
        }
    }
    dims
}

/// 前六个能解析的常用列；一个都没有就取 schema 前六列，空表取 *
fn projection(ctx: &TableContext<'_>) -> Vec<String> {
    let mut cols: Vec<String> = Vec::new();
    for alias in PROJECTION_PREFERENCE {
        if let Some(col) = ctx.resolve(alias) {
            if !cols.contains(&col) {
                cols.push(col);
            }
        }
        if cols.len() == PROJECTION_WIDTH {
            break;
        }
    }
    if cols.is_empty() {
        cols = ctx.columns.iter().take(PROJECTION_WIDTH).cloned().collect();
    }
    if cols.is_empty() {
        cols.push("*".to_string());
    }
    cols
}

/// 外部载荷校验：逐字段解析并改写为真实列名，地区列的取值统一规整
pub fn validate_external(ctx: &TableContext<'_>, vocab: &Vocabulary, payload: QueryIntent) -> Result<QueryIntent> {
    if payload.table != ctx.table() {
        return Err(GateError::MalformedExternalPayload(format!(
            "payload table '{}' does not match '{}'",
            payload.table,
            ctx.table()
        )));
    }

    let columns = match payload.columns {
        None => None,
        Some(list) if list.is_empty() => None,
        Some(list) if list.len() == 1 && list[0].trim() == "*" => None,
        Some(list) => {
            let mut resolved = Vec::with_capacity(list.len());
            for c in &list {
                if is_aggregate_expression(c) {
                    return Err(GateError::MalformedExternalPayload(format!(
                        "expression '{}' is not allowed in columns",
                        c
                    )));
                }
                resolved.push(ctx.require(c)?);
            }
            Some(resolved)
        }
    };

    let region_col = ctx.resolve("region");
    let mut filters = Vec::with_capacity(payload.filters.len());
    for f in payload.filters {
        let col = ctx.require(&f.col)?;
        let op: Operator = f.op.parse()?;
        let val = if region_col.as_deref() == Some(col.as_str()) {
            normalize_region_value(vocab, f.val)
        } else {
            f.val
        };
        filters.push(Filter::new(col, op, val));
    }

    let group_by = payload
        .group_by
        .iter()
        .map(|g| ctx.require(g))
        .collect::<Result<Vec<_>>>()?;

    let mut agg = BTreeMap::new();
    for (alias, source) in payload.agg {
        agg.insert(alias, ctx.require(&source)?);
    }

    let mut order_by = Vec::with_capacity(payload.order_by.len());
    for o in payload.order_by {
        let col = o.col.trim();
        let col = if agg.contains_key(col) || col == COUNT_ALIAS {
            col.to_string()
        } else {
            ctx.require(col)?
        };
        order_by.push(OrderSpec { col, dir: o.dir });
    }

    Ok(QueryIntent {
        table: payload.table,
        columns,
        filters,
        group_by,
        agg,
        order_by,
        limit: payload.limit,
    })
}

fn normalize_region_value(vocab: &Vocabulary, val: Value) -> Value {
    match val {
        Value::String(s) => Value::String(vocab.normalize_region(&s)),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| normalize_region_value(vocab, v))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema_cache::tests::FakeFetcher;
    use serde_json::json;
    use std::sync::Arc;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 15).unwrap()
    }

    fn run(vocab: &Vocabulary, text: &str, default_table: &str) -> Assembly {
        let schemas = FakeFetcher::gold().schemas;
        let choice = choose_table(vocab, text, default_table);
        let ctx = TableContext::new(
            vocab.profile(&choice.table).unwrap(),
            Arc::new(schemas[&choice.table].clone()),
        );
        assemble(&ctx, vocab, &Limits::default(), text, &choice, today())
    }

    #[test]
    fn mrr_by_region_for_year() {
        let vocab = Vocabulary::standard().unwrap();
        let a = run(&vocab, "Show MRR by region for 2025", "gold.mrr");
        let expected: QueryIntent = serde_json::from_value(json!({
            "table": "gold.mrr",
            "group_by": ["region"],
            "agg": {"total_revenue_sum": "total_revenue"},
            "filters": [{"col": "year", "op": "=", "val": 2025}],
            "order_by": [{"col": "total_revenue_sum", "dir": "desc"}],
            "limit": 50
        }))
        .unwrap();
        assert_eq!(a.intent, expected);
        assert_eq!(a.trace.shape, ShapeRule::ByDimension);
        assert_eq!(a.trace.intent, IntentKind::Select);
        assert_eq!(a.trace.dimensions, vec!["region".to_string()]);
    }

    #[test]
    fn top_features_by_users() {
        let vocab = Vocabulary::standard().unwrap();
        let a = run(&vocab, "Top 10 features by unique users", "gold.mrr");
        assert_eq!(a.intent.table, "gold.feature_adoption");
        assert_eq!(a.intent.group_by, vec!["feature_name".to_string()]);
        assert_eq!(
            a.intent.agg,
            BTreeMap::from([("feature_users_sum".to_string(), "feature_users".to_string())])
        );
        assert_eq!(a.intent.order_by, vec![OrderSpec::desc("feature_users_sum")]);
        assert_eq!(a.intent.limit, Some(10));
        assert_eq!(a.trace.shape, ShapeRule::Topk);
        assert_eq!(a.trace.table, TableSource::Keyword("feature".into()));
    }

    #[test]
    fn cohort_intent_forces_retention_table() {
        let vocab = Vocabulary::standard().unwrap();
        let a = run(&vocab, "cohort view of mrr", "gold.mrr");
        assert_eq!(a.intent.table, COHORT_TABLE);
        assert_eq!(a.trace.table, TableSource::ForcedCohort);
        assert_eq!(a.intent.group_by, vec!["signup_month".to_string(), "activity_month".to_string()]);
        assert_eq!(
            a.intent.agg,
            BTreeMap::from([("active_users_sum".to_string(), "active_users".to_string())])
        );
        assert_eq!(
            a.intent.order_by,
            vec![OrderSpec::desc("signup_month"), OrderSpec::desc("activity_month")]
        );
        assert_eq!(a.trace.shape, ShapeRule::Cohort);
    }

    #[test]
    fn trend_groups_by_period_most_recent_first() {
        let vocab = Vocabulary::standard().unwrap();
        let a = run(&vocab, "churn trend in Dublin", "gold.mrr");
        assert_eq!(a.intent.table, "gold.churn_rate");
        assert_eq!(a.intent.group_by, vec!["year".to_string(), "month".to_string()]);
        assert_eq!(a.intent.order_by[0], OrderSpec::desc("year"));
        assert!(a.intent.agg.contains_key("churned_users_sum"));
        assert_eq!(a.intent.filters, vec![Filter::new("region", Operator::Eq, "ie-dublin")]);
        assert_eq!(a.trace.shape, ShapeRule::Trend);
    }

    #[test]
    fn trend_without_time_axes_falls_back_to_projection() {
        let vocab = Vocabulary::standard().unwrap();
        let a = run(&vocab, "lifetime value over time", "gold.mrr");
        assert_eq!(a.intent.table, "gold.ltv");
        assert_eq!(a.trace.shape, ShapeRule::FallbackProjection);
        assert!(a.intent.group_by.is_empty());
        assert_eq!(
            a.intent.columns,
            Some(vec!["user_count".to_string(), "region".to_string()])
        );
    }

    #[test]
    fn count_on_feature_table_sums_users() {
        let vocab = Vocabulary::standard().unwrap();
        let a = run(&vocab, "how many feature users", "gold.mrr");
        assert_eq!(a.intent.columns, Some(vec!["SUM(feature_users) AS user_count".to_string()]));
        assert_eq!(a.intent.limit, Some(1));
        assert_eq!(a.trace.shape, ShapeRule::Count);

        let churn = run(&vocab, "count churn rows", "gold.mrr");
        assert_eq!(churn.intent.columns, Some(vec!["COUNT(*) AS cnt".to_string()]));
    }

    #[test]
    fn unresolved_metric_groups_with_row_count() {
        let vocab = Vocabulary::standard().unwrap();
        let a = run(&vocab, "churn by region", "gold.mrr");
        // churned_users 存在，因此是求和
        assert!(a.intent.agg.contains_key("churned_users_sum"));

        let vocab = Vocabulary::standard().unwrap();
        let profile = vocab.profile("gold.mrr").unwrap();
        let ctx = TableContext::new(profile, Arc::new(vec!["region".to_string(), "year".to_string()]));
        let choice = choose_table(&vocab, "mrr by region", "gold.mrr");
        let a = assemble(&ctx, &vocab, &Limits::default(), "mrr by region", &choice, today());
        assert!(a.intent.agg.is_empty());
        assert_eq!(a.intent.order_by, vec![OrderSpec::desc("cnt")]);
    }

    #[test]
    fn plain_select_projects_preferred_columns() {
        let vocab = Vocabulary::standard().unwrap();
        let a = run(&vocab, "show me mrr", "gold.mrr");
        assert_eq!(
            a.intent.columns,
            Some(vec![
                "total_revenue".to_string(),
                "region".to_string(),
                "year".to_string(),
                "month".to_string()
            ])
        );
        assert_eq!(a.trace.shape, ShapeRule::Projection);
        assert_eq!(a.trace.limit.source, intent::LimitSource::Default);
    }

    fn mrr_ctx(vocab: &Vocabulary) -> TableContext<'_> {
        TableContext::new(
            vocab.profile("gold.mrr").unwrap(),
            Arc::new(FakeFetcher::gold().schemas["gold.mrr"].clone()),
        )
    }

    #[test]
    fn external_payload_is_rewritten_to_real_columns() {
        let vocab = Vocabulary::standard().unwrap();
        let ctx = mrr_ctx(&vocab);
        let raw: QueryIntent = serde_json::from_value(json!({
            "table": "gold.mrr",
            "columns": ["Region", "revenue"],
            "filters": [
                {"col": "plan", "op": "==", "val": "pro"},
                {"col": "region", "op": "in", "val": ["London", "Bangalore"]}
            ],
            "group_by": ["region"],
            "agg": {"rev": "amount"},
            "order_by": [{"col": "rev", "dir": "desc"}, {"col": "YEAR", "dir": "asc"}],
            "limit": 20
        }))
        .unwrap();
        let v = validate_external(&ctx, &vocab, raw).unwrap();
        assert_eq!(v.columns, Some(vec!["region".to_string(), "total_revenue".to_string()]));
        assert_eq!(
            v.filters,
            vec![
                Filter::new("subscription_plan", Operator::Eq, "pro"),
                Filter::new("region", Operator::In, json!(["uk-england-london", "in-bengaluru"])),
            ]
        );
        assert_eq!(v.agg["rev"], "total_revenue");
        assert_eq!(v.order_by[1].col, "year");
    }

    #[test]
    fn external_unresolved_field_is_a_hard_error() {
        let vocab = Vocabulary::standard().unwrap();
        let ctx = mrr_ctx(&vocab);
        let mut raw = QueryIntent::for_table("gold.mrr");
        raw.group_by = vec!["continent".into()];
        assert!(matches!(
            validate_external(&ctx, &vocab, raw),
            Err(GateError::UnresolvedColumn { token, .. }) if token == "continent"
        ));

        let mut raw = QueryIntent::for_table("gold.mrr");
        raw.columns = Some(vec!["SUM(mrr) AS total".into()]);
        assert!(matches!(
            validate_external(&ctx, &vocab, raw),
            Err(GateError::MalformedExternalPayload(_))
        ));

        let mut raw = QueryIntent::for_table("gold.mrr");
        raw.filters = vec![Filter {
            col: "region".into(),
            op: "between".into(),
            val: json!("x"),
        }];
        assert_eq!(
            validate_external(&ctx, &vocab, raw),
            Err(GateError::InvalidOperator("between".into()))
        );
    }

    #[test]
    fn external_star_means_all_columns() {
        let vocab = Vocabulary::standard().unwrap();
        let ctx = mrr_ctx(&vocab);
        let mut raw = QueryIntent::for_table("gold.mrr");
        raw.columns = Some(vec!["*".into()]);
        assert_eq!(validate_external(&ctx, &vocab, raw).unwrap().columns, None);
    }
}
