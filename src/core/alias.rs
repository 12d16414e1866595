use serde::Serialize;

use crate::core::profiles::TableProfile;
use crate::core::schema_cache::ColumnSet;
use crate::error::{GateError, Result};

/// 命中的匹配层级，先到先得
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    Canonical,
    CaseInsensitive,
    Substring,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub column: String,
    pub via: MatchKind,
}

/// 把自由文本或 LLM 给出的候选词映射到表的真实列名。
///
/// 顺序：原样列名 -> 规范别名表 -> 忽略大小写 -> 子串 (按 schema 顺序取第一个)。
pub fn resolve(profile: &TableProfile, columns: &[String], candidate: &str) -> Option<Resolution> {
    if candidate.trim().is_empty() {
        return None;
    }
    if columns.iter().any(|c| c == candidate) {
        return Some(Resolution {
            column: candidate.to_string(),
            via: MatchKind::Exact,
        });
    }

    let lowered = candidate.trim().to_lowercase();
    if let Some(mapped) = profile.canonical(&lowered) {
        if columns.iter().any(|c| c == mapped) {
            return Some(Resolution {
                column: mapped.to_string(),
                via: MatchKind::Canonical,
            });
        }
    }

    if let Some(c) = columns.iter().find(|c| c.to_lowercase() == lowered) {
        return Some(Resolution {
            column: c.clone(),
            via: MatchKind::CaseInsensitive,
        });
    }

    columns
        .iter()
        .find(|c| {
            let col = c.to_lowercase();
            col.contains(&lowered) || lowered.contains(&col)
        })
        .map(|c| Resolution {
            column: c.clone(),
            via: MatchKind::Substring,
        })
}

/// 外部载荷校验用：解析失败即硬错误
pub fn resolve_required(profile: &TableProfile, columns: &[String], candidate: &str) -> Result<String> {
    resolve(profile, columns, candidate)
        .map(|r| r.column)
        .ok_or_else(|| GateError::UnresolvedColumn {
            table: profile.table.to_string(),
            token: candidate.to_string(),
        })
}

/// 依次尝试多个别名，返回第一个能解析的列
pub fn resolve_first(profile: &TableProfile, columns: &[String], candidates: &[&str]) -> Option<String> {
    candidates
        .iter()
        .find_map(|c| resolve(profile, columns, c))
        .map(|r| r.column)
}

/// 一张表的策略记录与其当前列集合，供抽取与组装阶段解析别名
pub struct TableContext<'a> {
    pub profile: &'a TableProfile,
    pub columns: ColumnSet,
}

impl<'a> TableContext<'a> {
    pub fn new(profile: &'a TableProfile, columns: ColumnSet) -> Self {
        Self { profile, columns }
    }

    pub fn table(&self) -> &'static str {
        self.profile.table
    }

    pub fn resolve(&self, token: &str) -> Option<String> {
        resolve(self.profile, &self.columns, token).map(|r| r.column)
    }

    pub fn resolve_first(&self, candidates: &[&str]) -> Option<String> {
        resolve_first(self.profile, &self.columns, candidates)
    }

    pub fn require(&self, token: &str) -> Result<String> {
        resolve_required(self.profile, &self.columns, token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::profiles::Vocabulary;

    fn mrr_columns() -> Vec<String> {
        [
            "year",
            "month",
            "region",
            "subscription_plan",
            "total_revenue",
            "avg_revenue_per_user",
            "mrr",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    #[test]
    fn resolution_order_first_match_wins() {
        let vocab = Vocabulary::standard().unwrap();
        let mrr = vocab.profile("gold.mrr").unwrap();
        let cols = mrr_columns();

        let exact = resolve(mrr, &cols, "mrr").unwrap();
        assert_eq!((exact.column.as_str(), exact.via), ("mrr", MatchKind::Exact));

        let canonical = resolve(mrr, &cols, "Plan").unwrap();
        assert_eq!(canonical.column, "subscription_plan");
        assert_eq!(canonical.via, MatchKind::Canonical);

        let ci = resolve(mrr, &cols, "REGION").unwrap();
        assert_eq!(ci.via, MatchKind::Canonical);
        let ci = resolve(mrr, &cols, "Total_Revenue").unwrap();
        assert_eq!((ci.column.as_str(), ci.via), ("total_revenue", MatchKind::CaseInsensitive));
    }

    #[test]
    fn revenue_resolves_by_substring_in_schema_order() {
        let vocab = Vocabulary::standard().unwrap();
        let mrr = vocab.profile("gold.mrr").unwrap();
        let r = resolve(mrr, &mrr_columns(), "revenue").unwrap();
        assert_eq!(r.column, "total_revenue");
        assert_eq!(r.via, MatchKind::Substring);
    }

    #[test]
    fn exact_beats_substring() {
        let vocab = Vocabulary::standard().unwrap();
        let mrr = vocab.profile("gold.mrr").unwrap();
        // "month" 也是 "months" 的子串，但原样列名优先
        let cols = vec!["months".to_string(), "month".to_string()];
        assert_eq!(resolve(mrr, &cols, "month").unwrap().via, MatchKind::Exact);
    }

    #[test]
    fn unresolved_is_a_hard_error() {
        let vocab = Vocabulary::standard().unwrap();
        let mrr = vocab.profile("gold.mrr").unwrap();
        let cols = mrr_columns();
        assert!(resolve(mrr, &cols, "").is_none());
        let err = resolve_required(mrr, &cols, "unique").unwrap_err();
        assert_eq!(
            err,
            GateError::UnresolvedColumn {
                table: "gold.mrr".into(),
                token: "unique".into()
            }
        );
        assert_eq!(
            resolve_first(mrr, &cols, &["nope", "amount"]).as_deref(),
            Some("total_revenue")
        );
    }

    #[test]
    fn canonical_target_must_exist_in_live_schema() {
        let vocab = Vocabulary::standard().unwrap();
        let mrr = vocab.profile("gold.mrr").unwrap();
        // 规范别名指向的列已不在 schema 中时不采用
        let cols = vec!["region".to_string()];
        assert!(resolve(mrr, &cols, "amount").is_none());
    }

    #[test]
    fn resolution_is_deterministic() {
        let vocab = Vocabulary::standard().unwrap();
        let mrr = vocab.profile("gold.mrr").unwrap();
        let cols = mrr_columns();
        let first = resolve(mrr, &cols, "revenue_per");
        for _ in 0..10 {
            assert_eq!(resolve(mrr, &cols, "revenue_per"), first);
        }
        assert_eq!(first.unwrap().column, "avg_revenue_per_user");
    }
}
