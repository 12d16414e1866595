//! 启发式意图抽取：意图分类、选表、行数、日期、地区/套餐过滤与 "by <维度>"。
//!
//! 所有函数都是输入文本 (必要时加上表的列集合与注入的当天日期) 的纯函数，
//! 每条证据都带着命中的抽取路径，便于断言启发式来源。

use chrono::{Datelike, Days, NaiveDate};
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;
use tracing::debug;

use crate::config::Limits;
use crate::core::alias::TableContext;
use crate::core::profiles::{Vocabulary, TIMESTAMP_ALIAS};
use crate::models::query::{Filter, Operator};

static LIMIT_KEYWORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:top|limit|first|last)\b\s+(\d+)\b").unwrap());
static BARE_INT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(\d+)\b").unwrap());
static EXPLICIT_YEAR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(20\d{2})\b").unwrap());
static LAST_DAYS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\blast\s+(\d+)\s+days?\b").unwrap());
static MONTH_YEAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\s+(\d{4})\b").unwrap()
});
static FROM_TO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bfrom\s+([A-Za-z0-9\-\s,/]+?)\s+to\s+([A-Za-z0-9\-\s,/]+)").unwrap()
});
static REGION_PHRASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:in|for|from)\s+([A-Za-z0-9\-\s]+?)(?:,|$|\b(?:in|for|from|on|at)\b)").unwrap()
});
static TRAILING_PREPOSITION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s+(?:in|for|from|on|at)\s*$").unwrap());
static PLAN_KEYWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(pro|enterprise|trial|free|basic|premium|team)\b").unwrap()
});
static BY_DIMENSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bby\s+([A-Za-z0-9_\-]+)\b").unwrap());

const REGION_KEYWORDS: [&str; 7] = ["uk", "ireland", "scotland", "glasgow", "dublin", "berlin", "bengaluru"];

// 短语开头的冠词、限定词不是地区
const REGION_STOP_WORDS: [&str; 14] = [
    "the", "a", "an", "this", "that", "these", "those", "past", "last", "next", "previous", "current", "every", "all",
];

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

const DATE_FORMATS: [&str; 6] = ["%Y-%m-%d", "%Y/%m/%d", "%d %B %Y", "%B %d %Y", "%m/%d/%Y", "%d-%m-%Y"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    Trend,
    Topk,
    Count,
    Aggregate,
    Cohort,
    Select,
}

// 固定优先级，只返回一个意图
const INTENT_RULES: [(IntentKind, f64, &[&str]); 5] = [
    (
        IntentKind::Trend,
        0.85,
        &["trend", "over time", "monthly", "weekly", "per month", "by month"],
    ),
    (IntentKind::Topk, 0.9, &["top", "most", "highest", "rank"]),
    (IntentKind::Count, 0.9, &["count", "how many", "number of", "total"]),
    (IntentKind::Aggregate, 0.85, &["average", "avg", "mean"]),
    (IntentKind::Cohort, 0.9, &["retention", "cohort"]),
];

pub fn classify(text: &str) -> (IntentKind, f64) {
    let t = text.to_lowercase();
    INTENT_RULES
        .iter()
        .find(|(_, _, keywords)| keywords.iter().any(|k| t.contains(k)))
        .map(|(kind, score, _)| (*kind, *score))
        .unwrap_or((IntentKind::Select, 0.6))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "via", content = "keyword", rename_all = "snake_case")]
pub enum TableSource {
    Keyword(String),
    Default,
    /// cohort 意图强制改用留存表
    ForcedCohort,
}

/// 按表策略记录的顺序做关键词选表，未命中则用调用方给的默认表
pub fn pick_table(vocab: &Vocabulary, text: &str, default_table: &str) -> (String, TableSource) {
    let t = text.to_lowercase();
    for profile in vocab.profiles() {
        if let Some(kw) = profile.keywords.iter().find(|k| t.contains(*k)) {
            return (profile.table.to_string(), TableSource::Keyword(kw.to_string()));
        }
    }
    (default_table.to_string(), TableSource::Default)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitSource {
    Keyword,
    BareNumber,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LimitEvidence {
    pub value: i64,
    pub source: LimitSource,
    /// 超过单查询上限后被替换为默认行数上限
    pub clamped: bool,
}

/// 优先取 `top|limit|first|last N`；否则取第一个非年份 (1900..=2100 之外) 的整数
pub fn extract_limit(text: &str, limits: &Limits) -> LimitEvidence {
    let keyword = LIMIT_KEYWORD
        .captures_iter(text)
        .find_map(|c| c[1].parse::<i64>().ok());
    let (mut value, mut source) = match keyword {
        Some(n) => (n, LimitSource::Keyword),
        None => match BARE_INT
            .captures_iter(text)
            .filter_map(|c| c[1].parse::<i64>().ok())
            .find(|n| !(1900..=2100).contains(n))
        {
            Some(n) => (n, LimitSource::BareNumber),
            None => (limits.default_limit, LimitSource::Default),
        },
    };

    if value <= 0 {
        value = limits.default_limit;
        source = LimitSource::Default;
    }
    let clamped = value > limits.max_limit_per_query;
    if clamped {
        debug!("提取的行数 {} 超过上限，替换为 {}", value, limits.max_rows_return);
        value = limits.max_rows_return;
    }
    LimitEvidence { value, source, clamped }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DateEvidence {
    ExplicitYear { year: i32 },
    LastDays { days: u64, start: NaiveDate, end: NaiveDate },
    MonthYear { start: NaiveDate, end: NaiveDate },
    FromTo { start: NaiveDate, end: NaiveDate },
}

impl DateEvidence {
    pub fn range(&self) -> Option<(NaiveDate, NaiveDate)> {
        match self {
            DateEvidence::ExplicitYear { .. } => None,
            DateEvidence::LastDays { start, end, .. }
            | DateEvidence::MonthYear { start, end }
            | DateEvidence::FromTo { start, end } => Some((*start, *end)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateMatch {
    pub evidence: DateEvidence,
    /// 命中的原文片段，地区抽取前需从工作文本中去掉
    pub matched: String,
}

/// 四种写法互斥，按 显式年份 -> 最近 N 天 -> 月份+年份 -> from..to 的顺序先到先得
pub fn extract_dates(text: &str, today: NaiveDate) -> Option<DateMatch> {
    if let Some(c) = EXPLICIT_YEAR.captures(text) {
        if let Ok(year) = c[1].parse::<i32>() {
            return Some(DateMatch {
                evidence: DateEvidence::ExplicitYear { year },
                matched: c[1].to_string(),
            });
        }
    }

    if let Some(c) = LAST_DAYS.captures(text) {
        if let Ok(days) = c[1].parse::<u64>() {
            if let Some(start) = today.checked_sub_days(Days::new(days)) {
                return Some(DateMatch {
                    evidence: DateEvidence::LastDays { days, start, end: today },
                    matched: c[0].to_string(),
                });
            }
        }
    }

    if let Some(c) = MONTH_YEAR.captures(text) {
        let month = month_number(&c[1]);
        let year = c[2].parse::<i32>().ok();
        if let Some((start, end)) = month.zip(year).and_then(|(m, y)| month_bounds(y, m)) {
            return Some(DateMatch {
                evidence: DateEvidence::MonthYear { start, end },
                matched: c[0].to_string(),
            });
        }
    }

    if let Some(c) = FROM_TO.captures(text) {
        let start = parse_loose_date(&c[1], false);
        let end = parse_loose_date(&c[2], true);
        if let (Some(start), Some(end)) = (start, end) {
            return Some(DateMatch {
                evidence: DateEvidence::FromTo { start, end },
                matched: c[0].to_string(),
            });
        }
    }

    None
}

fn month_number(token: &str) -> Option<u32> {
    let prefix = token.get(..3)?.to_lowercase();
    MONTHS.iter().position(|m| *m == prefix).map(|i| i as u32 + 1)
}

fn month_bounds(year: i32, month: u32) -> Option<(NaiveDate, NaiveDate)> {
    let start = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    Some((start, next.pred_opt()?))
}

/// 宽松日期解析；允许结束日期后面跟着其它词，从最长前缀开始尝试
fn parse_loose_date(raw: &str, is_end: bool) -> Option<NaiveDate> {
    let cleaned = raw.replace(',', " ");
    let words: Vec<&str> = cleaned.split_whitespace().collect();
    for n in (1..=words.len()).rev() {
        let candidate = words[..n].join(" ");
        for fmt in DATE_FORMATS {
            if let Ok(d) = NaiveDate::parse_from_str(&candidate, fmt) {
                return Some(d);
            }
        }
        // "March 2024" 这类只有月份与年份
        if let Ok(first) = NaiveDate::parse_from_str(&format!("1 {}", candidate), "%d %B %Y") {
            return if is_end {
                month_bounds(first.year(), first.month()).map(|(_, last)| last)
            } else {
                Some(first)
            };
        }
    }
    None
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "via", content = "raw", rename_all = "snake_case")]
pub enum RegionSource {
    /// `in|for|from <地区>` 短语
    Phrase(String),
    /// 已知地区关键词扫描
    Keyword(String),
}

/// 去掉年份等干扰后，取 `in|for|from` 之后、标点或下一个介词之前的短语
pub fn extract_region_phrase(working: &str) -> Option<String> {
    let c = REGION_PHRASE.captures(working)?;
    let candidate = c[1].trim();
    let candidate = TRAILING_PREPOSITION.replace(candidate, "");
    let candidate = EXPLICIT_YEAR.replace_all(&candidate, "");
    let words: Vec<&str> = candidate
        .split_whitespace()
        .skip_while(|w| REGION_STOP_WORDS.iter().any(|s| w.eq_ignore_ascii_case(s)))
        .collect();
    if words.is_empty() {
        None
    } else {
        Some(words.join(" "))
    }
}

pub fn scan_region_keyword(text: &str) -> Option<&'static str> {
    let t = text.to_lowercase();
    REGION_KEYWORDS.into_iter().find(|kw| {
        t.split(|ch: char| !(ch.is_alphanumeric() || ch == '_'))
            .any(|word| word == *kw)
    })
}

pub fn scan_plan(text: &str) -> Option<String> {
    PLAN_KEYWORD.captures(text).map(|c| c[1].to_lowercase())
}

/// 每个 `by <token>` 都是一个候选分组维度 (小写，保持原文顺序)
pub fn extract_by_dimensions(text: &str) -> Vec<String> {
    BY_DIMENSION
        .captures_iter(text)
        .map(|c| c[1].to_lowercase())
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterEvidence {
    pub filters: Vec<Filter>,
    pub date: Option<DateEvidence>,
    pub region: Option<RegionSource>,
    pub plan: Option<String>,
}

/// 抽取年份/日期区间、地区与套餐过滤，列名全部经别名解析；表里没有对应列的条件直接跳过
pub fn extract_filters(ctx: &TableContext<'_>, vocab: &Vocabulary, text: &str, today: NaiveDate) -> FilterEvidence {
    let mut evidence = FilterEvidence::default();
    let mut working = text.to_string();

    if let Some(date) = extract_dates(text, today) {
        match &date.evidence {
            DateEvidence::ExplicitYear { year } => {
                if let Some(col) = ctx.resolve("year") {
                    evidence.filters.push(Filter::new(col, Operator::Eq, *year));
                }
                let token = Regex::new(&format!(r"\b{}\b", regex::escape(&date.matched)));
                if let Ok(token) = token {
                    working = token.replace_all(&working, " ").into_owned();
                }
            }
            other => {
                if let (Some((start, end)), Some(col)) = (other.range(), ctx.resolve(TIMESTAMP_ALIAS)) {
                    evidence.filters.push(Filter::new(col.clone(), Operator::Gte, start.to_string()));
                    evidence.filters.push(Filter::new(col, Operator::Lte, end.to_string()));
                }
                working = working.replace(&date.matched, " ");
            }
        }
        evidence.date = Some(date.evidence);
    }

    let region_col = ctx.resolve("region");
    if let Some(phrase) = extract_region_phrase(&working) {
        if let Some(col) = &region_col {
            evidence
                .filters
                .push(Filter::new(col.clone(), Operator::Eq, vocab.normalize_region(&phrase)));
            evidence.region = Some(RegionSource::Phrase(phrase));
        }
    }
    if evidence.region.is_none() {
        if let (Some(token), Some(col)) = (scan_region_keyword(text), &region_col) {
            debug!("未识别地区短语，关键词兜底命中: {}", token);
            evidence
                .filters
                .push(Filter::new(col.clone(), Operator::Eq, vocab.normalize_region(token)));
            evidence.region = Some(RegionSource::Keyword(token.to_string()));
        }
    }

    if let Some(plan) = scan_plan(text) {
        if let Some(col) = ctx.resolve_first(&["plan", "subscription_plan"]) {
            evidence.filters.push(Filter::new(col, Operator::Eq, plan.clone()));
            evidence.plan = Some(plan);
        }
    }

    evidence
}
