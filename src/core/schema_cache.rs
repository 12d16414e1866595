use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::AllowList;
use crate::error::{GateError, Result};

/// 按 schema 顺序排列的列名，整体替换，不做局部更新
pub type ColumnSet = Arc<Vec<String>>;

/// 外部协作方："描述某张表的列"
#[async_trait]
pub trait ColumnFetcher: Send + Sync {
    async fn fetch_columns(&self, table: &str) -> anyhow::Result<Vec<String>>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    columns: ColumnSet,
    fetched_at: Instant,
}

impl CacheEntry {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }
}

type Flight = Arc<OnceCell<Result<ColumnSet>>>;

/// 白名单表的列缓存。
///
/// 新鲜条目直接返回；过期或缺失时发起一次拉取，同一张表的并发请求共享同一次拉取
/// (single-flight)。拉取失败时退回旧条目 (不论是否过期)，没有旧条目才报 `SchemaUnavailable`。
pub struct SchemaCache {
    allow_list: AllowList,
    ttl: Duration,
    fetcher: Arc<dyn ColumnFetcher>,
    entries: DashMap<String, CacheEntry>,
    in_flight: DashMap<String, Flight>,
    // 每次 clear 递增；清空前发起的拉取不再回写
    generation: AtomicU64,
}

impl SchemaCache {
    pub fn new(allow_list: AllowList, ttl: Duration, fetcher: Arc<dyn ColumnFetcher>) -> Self {
        Self {
            allow_list,
            ttl,
            fetcher,
            entries: DashMap::new(),
            in_flight: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    pub fn allow_list(&self) -> &AllowList {
        &self.allow_list
    }

    pub async fn get_columns(&self, table: &str) -> Result<ColumnSet> {
        if !self.allow_list.contains(table) {
            return Err(GateError::TableNotAllowed(table.to_string()));
        }

        if let Some(entry) = self.entries.get(table) {
            if entry.is_fresh(self.ttl) {
                return Ok(entry.columns.clone());
            }
        }

        // 不能在 await 期间持有 DashMap 的分片锁，先克隆出 Arc
        let flight: Flight = self
            .in_flight
            .entry(table.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let outcome = flight.get_or_init(|| self.refresh(table)).await.clone();
        self.in_flight.remove_if(table, |_, f| Arc::ptr_eq(f, &flight));
        outcome
    }

    async fn refresh(&self, table: &str) -> Result<ColumnSet> {
        // 前一轮拉取可能刚刚完成
        if let Some(entry) = self.entries.get(table) {
            if entry.is_fresh(self.ttl) {
                return Ok(entry.columns.clone());
            }
        }

        debug!("拉取表结构: {}", table);
        let generation = self.generation.load(Ordering::Acquire);
        let failure = match self.fetcher.fetch_columns(table).await {
            Ok(cols) if !cols.is_empty() => {
                let columns: ColumnSet = Arc::new(cols);
                if self.generation.load(Ordering::Acquire) != generation {
                    debug!("缓存已在拉取期间清空，结果不回写: {}", table);
                    return Ok(columns);
                }
                self.entries.insert(
                    table.to_string(),
                    CacheEntry {
                        columns: columns.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                info!("表结构已刷新: {} ({} 列)", table, columns.len());
                return Ok(columns);
            }
            Ok(_) => "schema fetch returned no columns".to_string(),
            Err(e) => e.to_string(),
        };

        match self.entries.get(table) {
            Some(prev) => {
                warn!("表结构拉取失败，降级使用旧缓存: {} ({})", table, failure);
                Ok(prev.columns.clone())
            }
            None => {
                warn!("表结构拉取失败且无缓存: {} ({})", table, failure);
                Err(GateError::SchemaUnavailable {
                    table: table.to_string(),
                    reason: failure,
                })
            }
        }
    }

    #[cfg(test)]
    pub fn set_columns(&self, table: &str, columns: Vec<String>) {
        self.entries.insert(
            table.to_string(),
            CacheEntry {
                columns: Arc::new(columns),
                fetched_at: Instant::now(),
            },
        );
    }

    /// 清空全部条目；进行中的拉取仍会应答自己的等待方，但不再写回缓存
    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.in_flight.clear();
        self.entries.clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    /// 内存版拉取器：计数、可切换失败、可注入延迟
    pub(crate) struct FakeFetcher {
        pub schemas: HashMap<String, Vec<String>>,
        pub calls: AtomicUsize,
        pub failing: AtomicBool,
        pub delay: Duration,
    }

    impl FakeFetcher {
        pub(crate) fn gold() -> Self {
            let schemas = [
                ("gold.churn_rate", vec!["year", "month", "region", "churned_users", "active_users", "churn_rate"]),
                (
                    "gold.feature_adoption",
                    vec!["feature_name", "feature_users", "total_active_users", "adoption_rate", "year", "month", "region"],
                ),
                (
                    "gold.mrr",
                    vec!["year", "month", "region", "subscription_plan", "total_revenue", "avg_revenue_per_user", "mrr"],
                ),
                ("gold.ltv", vec!["region", "subscription_plan", "ltv_type", "avg_ltv", "user_count"]),
                (
                    "gold.ltv_predicted",
                    vec![
                        "year",
                        "month",
                        "region",
                        "subscription_plan",
                        "total_revenue",
                        "avg_revenue_per_user",
                        "mrr",
                        "predicted_ltv",
                    ],
                ),
                (
                    "gold.user_retention_cohort",
                    vec![
                        "region",
                        "signup_month",
                        "activity_month",
                        "active_users",
                        "cohort_size",
                        "retention_rate",
                        "months_since_signup",
                    ],
                ),
            ]
            .into_iter()
            .map(|(t, cols)| (t.to_string(), cols.into_iter().map(String::from).collect()))
            .collect();
            Self {
                schemas,
                calls: AtomicUsize::new(0),
                failing: AtomicBool::new(false),
                delay: Duration::ZERO,
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ColumnFetcher for FakeFetcher {
        async fn fetch_columns(&self, table: &str) -> anyhow::Result<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("warehouse unreachable");
            }
            self.schemas
                .get(table)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("table not found: {}", table))
        }
    }

    fn cache_with(fetcher: Arc<FakeFetcher>, ttl: Duration) -> SchemaCache {
        SchemaCache::new(AllowList::default(), ttl, fetcher)
    }

    #[tokio::test]
    async fn disallowed_table_never_fetches() {
        let fetcher = Arc::new(FakeFetcher::gold());
        let cache = cache_with(fetcher.clone(), Duration::from_secs(300));
        let err = cache.get_columns("silver.secrets").await.unwrap_err();
        assert_eq!(err, GateError::TableNotAllowed("silver.secrets".into()));
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn fresh_entry_is_served_from_cache() {
        let fetcher = Arc::new(FakeFetcher::gold());
        let cache = cache_with(fetcher.clone(), Duration::from_secs(300));
        let first = cache.get_columns("gold.mrr").await.unwrap();
        let second = cache.get_columns("gold.mrr").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first[4], "total_revenue");
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn stale_entry_survives_fetch_failure() {
        let fetcher = Arc::new(FakeFetcher::gold());
        // TTL 为零：每次读取都视为过期
        let cache = cache_with(fetcher.clone(), Duration::ZERO);
        let cached = cache.get_columns("gold.ltv").await.unwrap();

        fetcher.failing.store(true, Ordering::SeqCst);
        let degraded = cache.get_columns("gold.ltv").await.unwrap();
        assert_eq!(cached, degraded);
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn failure_without_prior_entry_is_unavailable() {
        let fetcher = Arc::new(FakeFetcher::gold());
        fetcher.failing.store(true, Ordering::SeqCst);
        let cache = cache_with(fetcher.clone(), Duration::from_secs(300));
        let err = cache.get_columns("gold.churn_rate").await.unwrap_err();
        assert!(matches!(err, GateError::SchemaUnavailable { ref table, .. } if table == "gold.churn_rate"));
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_fetch() {
        let mut fake = FakeFetcher::gold();
        fake.delay = Duration::from_millis(50);
        let fetcher = Arc::new(fake);
        let cache = Arc::new(cache_with(fetcher.clone(), Duration::from_secs(300)));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_columns("gold.feature_adoption").await })
            })
            .collect();
        for h in handles {
            let cols = h.await.unwrap().unwrap();
            assert_eq!(cols[0], "feature_name");
        }
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn manual_set_and_clear() {
        let fetcher = Arc::new(FakeFetcher::gold());
        let cache = cache_with(fetcher.clone(), Duration::from_secs(300));
        cache.set_columns("gold.mrr", vec!["year".into(), "mrr".into()]);
        assert_eq!(cache.get_columns("gold.mrr").await.unwrap().len(), 2);
        assert_eq!(fetcher.calls(), 0);

        cache.clear();
        assert_eq!(cache.get_columns("gold.mrr").await.unwrap().len(), 7);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn clear_discards_fetch_already_in_flight() {
        let mut fake = FakeFetcher::gold();
        fake.delay = Duration::from_millis(50);
        let fetcher = Arc::new(fake);
        let cache = Arc::new(cache_with(fetcher.clone(), Duration::from_secs(300)));

        let pending = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_columns("gold.mrr").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.clear();

        // 等待方照常拿到结果
        assert_eq!(pending.await.unwrap().unwrap().len(), 7);
        // 但结果没有写回，下一次读取重新拉取
        assert_eq!(cache.get_columns("gold.mrr").await.unwrap().len(), 7);
        assert_eq!(fetcher.calls(), 2);
    }
}
