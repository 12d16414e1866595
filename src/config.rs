use anyhow::Context;
use std::collections::HashSet;
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_ALLOWED_TABLES: [&str; 6] = [
    "gold.churn_rate",
    "gold.feature_adoption",
    "gold.ltv",
    "gold.ltv_predicted",
    "gold.mrr",
    "gold.user_retention_cohort",
];

/// 进程级表白名单，启动后不可变
#[derive(Debug, Clone)]
pub struct AllowList {
    tables: Vec<String>,
    lowered: HashSet<String>,
}

impl AllowList {
    pub fn new<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tables: Vec<String> = tables.into_iter().map(Into::into).collect();
        let lowered = tables.iter().map(|t| t.to_lowercase()).collect();
        Self { tables, lowered }
    }

    /// 精确匹配 (schema.table 原样)
    pub fn contains(&self, table: &str) -> bool {
        self.tables.iter().any(|t| t == table)
    }

    /// SQL 文本层面的比对不区分大小写
    pub fn contains_ignore_case(&self, table: &str) -> bool {
        self.lowered.contains(&table.to_lowercase())
    }

    pub fn tables(&self) -> &[String] {
        &self.tables
    }
}

impl Default for AllowList {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_TABLES)
    }
}

/// 行数上限相关配置
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// 载荷未给出 limit 时的默认行数上限，也用于自由 SQL 追加的 LIMIT
    pub max_rows_return: i64,
    /// 单条查询允许的最大 limit
    pub max_limit_per_query: i64,
    /// 文本路径未提取到 limit 时使用
    pub default_limit: i64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_rows_return: 2000,
            max_limit_per_query: 5000,
            default_limit: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub warehouse_url: String,
    pub bind_addr: SocketAddr,
    pub allow_list: AllowList,
    pub default_table: String,
    pub limits: Limits,
    pub schema_cache_ttl: Duration,
    pub query_timeout: Duration,
    pub llm: Option<LlmConfig>,
}

impl GateConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let warehouse_url = env::var("WAREHOUSE_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .context("WAREHOUSE_URL (or DATABASE_URL) must be set")?;

        let allow_list = match env::var("ALLOWED_TABLES") {
            Ok(raw) => AllowList::new(
                raw.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string),
            ),
            Err(_) => AllowList::default(),
        };

        let defaults = Limits::default();
        let limits = Limits {
            max_rows_return: parse_var("MAX_ROWS_RETURN", defaults.max_rows_return)?,
            max_limit_per_query: parse_var("MAX_LIMIT_PER_QUERY", defaults.max_limit_per_query)?,
            default_limit: parse_var("DEFAULT_LIMIT", defaults.default_limit)?,
        };
        if limits.default_limit <= 0 || limits.default_limit > limits.max_limit_per_query {
            anyhow::bail!("DEFAULT_LIMIT must be within 1..=MAX_LIMIT_PER_QUERY");
        }
        if limits.max_rows_return <= 0 || limits.max_rows_return > limits.max_limit_per_query {
            anyhow::bail!("MAX_ROWS_RETURN must be within 1..=MAX_LIMIT_PER_QUERY");
        }

        let llm = env::var("LLM_API_KEY")
            .or_else(|_| env::var("OPENAI_API_KEY"))
            .ok()
            .filter(|k| !k.trim().is_empty())
            .map(|api_key| -> anyhow::Result<LlmConfig> {
                Ok(LlmConfig {
                    api_key,
                    base_url: env::var("LLM_BASE_URL")
                        .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
                    model: env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
                    temperature: parse_var("LLM_TEMPERATURE", 0.0)?,
                })
            })
            .transpose()?;

        Ok(Self {
            warehouse_url,
            bind_addr: parse_var("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8000)))?,
            allow_list,
            default_table: env::var("DEFAULT_TABLE")
                .unwrap_or_else(|_| "gold.feature_adoption".to_string()),
            limits,
            schema_cache_ttl: Duration::from_secs(parse_var("SCHEMA_CACHE_TTL", 300)?),
            query_timeout: Duration::from_secs(parse_var("QUERY_TIMEOUT", 120)?),
            llm,
        })
    }
}

fn parse_var<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: {:?}", name, raw)),
        Err(_) => Ok(default),
    }
}
