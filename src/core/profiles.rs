//! 六张 gold 表的策略记录：选表关键词、规范别名表、各意图使用的度量列与分组列。
//! 载荷组装器只读这些记录，不再按表名写分支。

use regex::Regex;
use std::sync::LazyLock;

use crate::config::AllowList;
use crate::core::alias_index::AliasIndex;

pub const COHORT_TABLE: &str = "gold.user_retention_cohort";

/// top-k 意图的分组列与度量列候选
#[derive(Debug, Clone, Copy)]
pub struct TopkRule {
    pub group: &'static [&'static str],
    pub metric: &'static [&'static str],
}

struct ProfileSpec {
    table: &'static str,
    keywords: &'static [&'static str],
    aliases: &'static [(&'static str, &'static str)],
    by_metric: &'static [&'static str],
    topk: Option<TopkRule>,
    trend_axes: &'static [&'static str],
    trend_metric: &'static [&'static str],
    count_metric: Option<&'static str>,
}

// 顺序即选表优先级
const PROFILE_SPECS: [ProfileSpec; 6] = [
    ProfileSpec {
        table: "gold.churn_rate",
        keywords: &["churn"],
        aliases: &[
            ("users", "churned_users"),
            ("churned_users", "churned_users"),
            ("active_users", "active_users"),
            ("region", "region"),
            ("year", "year"),
            ("month", "month"),
            ("churn_rate", "churn_rate"),
        ],
        by_metric: &["churned_users"],
        topk: None,
        trend_axes: &["year", "month"],
        trend_metric: &["churned_users"],
        count_metric: None,
    },
    ProfileSpec {
        table: "gold.feature_adoption",
        keywords: &["feature", "adoption"],
        aliases: &[
            ("feature", "feature_name"),
            ("users", "feature_users"),
            ("total_active_users", "total_active_users"),
            ("adoption_rate", "adoption_rate"),
            ("region", "region"),
            ("year", "year"),
            ("month", "month"),
        ],
        by_metric: &["users", "user_count"],
        topk: Some(TopkRule {
            group: &["feature"],
            metric: &["users"],
        }),
        trend_axes: &["year", "month"],
        trend_metric: &["users"],
        count_metric: Some("users"),
    },
    ProfileSpec {
        table: "gold.mrr",
        keywords: &["mrr", "revenue"],
        aliases: &[
            ("year", "year"),
            ("month", "month"),
            ("region", "region"),
            ("plan", "subscription_plan"),
            ("amount", "total_revenue"),
            ("mrr", "mrr"),
            ("avg_revenue_per_user", "avg_revenue_per_user"),
        ],
        by_metric: &["amount", "total_revenue"],
        topk: Some(TopkRule {
            group: &["region"],
            metric: &["amount"],
        }),
        trend_axes: &["year", "month"],
        trend_metric: &["mrr", "amount"],
        count_metric: None,
    },
    ProfileSpec {
        table: "gold.ltv_predicted",
        keywords: &["ltv predicted", "predicted ltv", "predicted"],
        aliases: &[
            ("year", "year"),
            ("month", "month"),
            ("region", "region"),
            ("plan", "subscription_plan"),
            ("amount", "total_revenue"),
            ("mrr", "mrr"),
            ("predicted_ltv", "predicted_ltv"),
            ("avg_revenue_per_user", "avg_revenue_per_user"),
            ("churned_users", "churned_users"),
        ],
        by_metric: &["amount", "total_revenue"],
        topk: Some(TopkRule {
            group: &["region"],
            metric: &["amount"],
        }),
        trend_axes: &["year", "month"],
        trend_metric: &["mrr", "amount"],
        count_metric: None,
    },
    ProfileSpec {
        table: "gold.ltv",
        keywords: &["ltv", "lifetime value"],
        aliases: &[
            ("region", "region"),
            ("plan", "subscription_plan"),
            ("subscription_plan", "subscription_plan"),
            ("avg_ltv", "avg_ltv"),
            ("users", "user_count"),
        ],
        by_metric: &["amount", "total_revenue", "users"],
        topk: None,
        trend_axes: &["year", "month"],
        trend_metric: &["users"],
        count_metric: None,
    },
    ProfileSpec {
        table: COHORT_TABLE,
        keywords: &["cohort", "retention"],
        aliases: &[
            ("region", "region"),
            ("signup_month", "signup_month"),
            ("activity_month", "activity_month"),
            ("active_users", "active_users"),
            ("cohort_size", "cohort_size"),
            ("retention_rate", "retention_rate"),
            ("months_since_signup", "months_since_signup"),
            ("month", "signup_month"),
        ],
        by_metric: &["users", "user_count"],
        topk: None,
        trend_axes: &["signup_month", "activity_month"],
        trend_metric: &["active_users"],
        count_metric: None,
    },
];

const REGION_ALIASES: [(&str, &str); 18] = [
    ("london", "uk-england-london"),
    ("uk london", "uk-england-london"),
    ("uk-england-london", "uk-england-london"),
    ("glasgow", "uk-scotland-glasgow"),
    ("scotland glasgow", "uk-scotland-glasgow"),
    ("uk-scotland-glasgow", "uk-scotland-glasgow"),
    ("dublin", "ie-dublin"),
    ("ie dublin", "ie-dublin"),
    ("ie-dublin", "ie-dublin"),
    ("berlin", "de-berlin"),
    ("de berlin", "de-berlin"),
    ("de-berlin", "de-berlin"),
    ("bengaluru", "in-bengaluru"),
    ("bangalore", "in-bengaluru"),
    ("in bengaluru", "in-bengaluru"),
    ("in-bengaluru", "in-bengaluru"),
    ("us-remote", "us-remote"),
    ("us remote", "us-remote"),
];

/// 日期区间过滤落到的时间戳列
pub const TIMESTAMP_ALIAS: &str = "subscription_ts";

static REGION_NOISE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w\s\-]").unwrap());
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

pub struct TableProfile {
    pub table: &'static str,
    pub keywords: &'static [&'static str],
    aliases: AliasIndex,
    /// "by <维度>" 时求和的度量；全部解析失败则退化为 COUNT(*)
    pub by_metric: &'static [&'static str],
    pub topk: Option<TopkRule>,
    pub trend_axes: &'static [&'static str],
    pub trend_metric: &'static [&'static str],
    pub count_metric: Option<&'static str>,
}

impl TableProfile {
    fn build(spec: &ProfileSpec) -> anyhow::Result<Self> {
        Ok(Self {
            table: spec.table,
            keywords: spec.keywords,
            aliases: AliasIndex::build(spec.aliases)?,
            by_metric: spec.by_metric,
            topk: spec.topk,
            trend_axes: spec.trend_axes,
            trend_metric: spec.trend_metric,
            count_metric: spec.count_metric,
        })
    }

    /// 规范别名表查询，参数须已小写
    pub fn canonical(&self, alias: &str) -> Option<&str> {
        self.aliases.get(alias)
    }
}

/// 启动时构建一次的全部静态词汇
pub struct Vocabulary {
    profiles: Vec<TableProfile>,
    regions: AliasIndex,
}

impl Vocabulary {
    pub fn standard() -> anyhow::Result<Self> {
        let profiles = PROFILE_SPECS
            .iter()
            .map(TableProfile::build)
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self {
            profiles,
            regions: AliasIndex::build(&REGION_ALIASES)?,
        })
    }

    /// 白名单中的每张表都必须有策略记录，否则拒绝启动
    pub fn ensure_covers(&self, allow_list: &AllowList) -> anyhow::Result<()> {
        let missing: Vec<&str> = allow_list
            .tables()
            .iter()
            .filter(|t| self.profile(t).is_none())
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            anyhow::bail!("allowed tables without a table profile: {}", missing.join(", "));
        }
        Ok(())
    }

    pub fn profile(&self, table: &str) -> Option<&TableProfile> {
        self.profiles.iter().find(|p| p.table == table)
    }

    /// 按选表优先级排列
    pub fn profiles(&self) -> &[TableProfile] {
        &self.profiles
    }

    /// 自由文本地区词规整为表中的规范地区值；未收录的原样返回 (去首尾空白)
    pub fn normalize_region(&self, token: &str) -> String {
        let trimmed = token.trim();
        let lowered = trimmed.to_lowercase();
        let cleaned = REGION_NOISE.replace_all(&lowered, " ");
        let key = WHITESPACE.replace_all(&cleaned, " ");
        match self.regions.get(key.trim()) {
            Some(canonical) => canonical.to_string(),
            None => trimmed.to_string(),
        }
    }
}
