//! 预审过的静态报表模板，每个模板绑定一张表。
//! 过滤条件与行数仍走构建器的渲染与校验，结果再过安全闸门。

use crate::core::builder::QueryBuilder;
use crate::core::gate::SafetyGate;
use crate::error::{GateError, Result};
use crate::models::query::{CompiledQuery, Filter};

#[derive(Debug, Clone, Copy)]
pub struct ReportTemplate {
    pub name: &'static str,
    pub table: &'static str,
    body: &'static str,
}

const WHERE_SLOT: &str = "{where_clause}";
const LIMIT_SLOT: &str = "{limit}";

const TEMPLATES: [ReportTemplate; 6] = [
    ReportTemplate {
        name: "churn_by_month",
        table: "gold.churn_rate",
        body: "SELECT year, month, region, SUM(churned_users) AS churned_users, \
               SUM(active_users) AS active_users, AVG(churn_rate) AS avg_churn_rate \
               FROM gold.churn_rate {where_clause} GROUP BY year, month, region \
               ORDER BY year DESC, month DESC LIMIT {limit}",
    },
    ReportTemplate {
        name: "top_features_by_users",
        table: "gold.feature_adoption",
        body: "SELECT feature_name, SUM(feature_users) AS total_feature_users, \
               SUM(total_active_users) AS total_active_users, AVG(adoption_rate) AS avg_adoption_rate, \
               year, month, region FROM gold.feature_adoption {where_clause} \
               GROUP BY feature_name, year, month, region ORDER BY total_feature_users DESC LIMIT {limit}",
    },
    ReportTemplate {
        name: "mrr_by_region",
        table: "gold.mrr",
        body: "SELECT year, month, region, subscription_plan, SUM(total_revenue) AS total_revenue, \
               AVG(avg_revenue_per_user) AS avg_revenue_per_user, SUM(mrr) AS mrr \
               FROM gold.mrr {where_clause} GROUP BY year, month, region, subscription_plan \
               ORDER BY year DESC, month DESC, mrr DESC LIMIT {limit}",
    },
    ReportTemplate {
        name: "ltv_by_region_plan",
        table: "gold.ltv",
        body: "SELECT region, subscription_plan, ltv_type, AVG(avg_ltv) AS avg_ltv, \
               SUM(user_count) AS user_count FROM gold.ltv {where_clause} \
               GROUP BY region, subscription_plan, ltv_type ORDER BY avg_ltv DESC LIMIT {limit}",
    },
    ReportTemplate {
        name: "ltv_predicted_by_month",
        table: "gold.ltv_predicted",
        body: "SELECT year, month, region, subscription_plan, SUM(total_revenue) AS total_revenue, \
               AVG(avg_revenue_per_user) AS avg_revenue_per_user, SUM(mrr) AS mrr, \
               AVG(predicted_ltv) AS predicted_ltv FROM gold.ltv_predicted {where_clause} \
               GROUP BY year, month, region, subscription_plan ORDER BY year DESC, month DESC LIMIT {limit}",
    },
    ReportTemplate {
        name: "cohort_retention_summary",
        table: "gold.user_retention_cohort",
        body: "SELECT region, signup_month, activity_month, SUM(active_users) AS active_users, \
               SUM(cohort_size) AS cohort_size, AVG(retention_rate) AS retention_rate, \
               AVG(months_since_signup) AS avg_months_since_signup \
               FROM gold.user_retention_cohort {where_clause} \
               GROUP BY region, signup_month, activity_month \
               ORDER BY signup_month DESC, activity_month DESC LIMIT {limit}",
    },
];

pub fn find(name: &str) -> Result<&'static ReportTemplate> {
    TEMPLATES
        .iter()
        .find(|t| t.name == name)
        .ok_or_else(|| GateError::TemplateNotFound(name.to_string()))
}

impl ReportTemplate {
    /// `columns` 是模板所绑定表的当前列集合
    pub fn render(
        &self,
        builder: &QueryBuilder,
        gate: &SafetyGate,
        columns: &[String],
        filters: &[Filter],
        limit: Option<i64>,
    ) -> Result<CompiledQuery> {
        let where_clause = builder.where_clause(self.table, filters, columns)?;
        let limit = builder.resolve_limit(limit)?;
        // 先填 limit，过滤值里出现的槽位文本不会被二次替换
        let filled = self.body.replace(LIMIT_SLOT, &limit.to_string());
        let sql = match where_clause {
            Some(w) => filled.replace(WHERE_SLOT, &w),
            None => filled.replace(&format!(" {}", WHERE_SLOT), ""),
        };
        gate.ensure(&sql)?;
        Ok(CompiledQuery::new(sql))
    }
}
