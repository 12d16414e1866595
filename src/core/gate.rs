//! SQL 文本层面的最终安全闸门。
//!
//! 与构建器完全独立：无论 SQL 来自载荷编译、报表模板还是用户直接提交，执行前都要过这一关。
//! 规则按顺序检查，第一个失败即返回。

use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::LazyLock;

use crate::config::AllowList;
use crate::error::{GateError, Result};

static SELECT_ONLY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^\s*select\s").unwrap());
static WRITE_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(insert|update|delete|drop|create|alter|truncate|merge|grant|revoke|replace|shutdown)\b",
    )
    .unwrap()
});
static EXPORT_CONSTRUCTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\binto\b|\b(outfile|dumpfile)\b").unwrap());
static TABLE_KEYWORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\b(?:from|join)\b").unwrap());
// FROM 列表到此为止
static CLAUSE_END: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:where|group|order|limit|offset|having|union|except|intersect|join|inner|left|right|full|cross|natural|on|using|window|fetch|for)\b|[()]",
    )
    .unwrap()
});
static QUALIFIED_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*\.[A-Za-z_][A-Za-z0-9_]*$").unwrap());
static BARE_IDENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// 词法差异：字符串转义、注释形式、引号含义
struct Dialect {
    backslash_in_strings: bool,
    backslash_in_double_quotes: bool,
    escape_string_prefix: bool,
    dollar_quotes: bool,
    nested_comments: bool,
    dash_comment_needs_space: bool,
    hash_comments: bool,
    executable_comments: bool,
}

// 同一段 SQL 在每种方言下各看一遍，任何一种看法里出现白名单外的表都拒绝
const DIALECTS: [Dialect; 4] = [
    // Postgres
    Dialect {
        backslash_in_strings: false,
        backslash_in_double_quotes: false,
        escape_string_prefix: true,
        dollar_quotes: true,
        nested_comments: true,
        dash_comment_needs_space: false,
        hash_comments: false,
        executable_comments: false,
    },
    // MySQL 默认模式
    Dialect {
        backslash_in_strings: true,
        backslash_in_double_quotes: true,
        escape_string_prefix: false,
        dollar_quotes: false,
        nested_comments: false,
        dash_comment_needs_space: true,
        hash_comments: true,
        executable_comments: true,
    },
    // MySQL ANSI_QUOTES
    Dialect {
        backslash_in_strings: true,
        backslash_in_double_quotes: false,
        escape_string_prefix: false,
        dollar_quotes: false,
        nested_comments: false,
        dash_comment_needs_space: true,
        hash_comments: true,
        executable_comments: true,
    },
    // MySQL NO_BACKSLASH_ESCAPES
    Dialect {
        backslash_in_strings: false,
        backslash_in_double_quotes: false,
        escape_string_prefix: false,
        dollar_quotes: false,
        nested_comments: false,
        dash_comment_needs_space: true,
        hash_comments: true,
        executable_comments: true,
    },
];

enum Span {
    /// 字符串字面量，替换为 `''`
    Literal(usize),
    /// 注释，替换为一个空格
    Comment(usize),
    /// 原样保留 (引号标识符、未闭合的结构)
    Keep(usize),
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
}

fn quoted_end(b: &[u8], start: usize, quote: u8, backslash: bool) -> Option<usize> {
    let mut j = start + 1;
    while j < b.len() {
        if backslash && b[j] == b'\\' {
            j += 2;
        } else if b[j] == quote {
            if b.get(j + 1) == Some(&quote) {
                j += 2;
            } else {
                return Some(j + 1);
            }
        } else {
            j += 1;
        }
    }
    None
}

fn line_end(sql: &str, start: usize) -> usize {
    sql[start..].find('\n').map_or(sql.len(), |n| start + n)
}

fn block_end(sql: &str, start: usize, nested: bool) -> Option<usize> {
    if !nested {
        return sql[start + 2..].find("*/").map(|n| start + 2 + n + 2);
    }
    let b = sql.as_bytes();
    let (mut depth, mut j) = (0usize, start);
    while j + 1 < b.len() {
        match (b[j], b[j + 1]) {
            (b'/', b'*') => {
                depth += 1;
                j += 2;
            }
            (b'*', b'/') => {
                depth -= 1;
                j += 2;
                if depth == 0 {
                    return Some(j);
                }
            }
            _ => j += 1,
        }
    }
    None
}

/// `$tag$ ... $tag$`；不是合法开头时返回 None，按普通字符处理
fn dollar_end(sql: &str, start: usize) -> Option<usize> {
    let b = sql.as_bytes();
    if start > 0 && is_ident_byte(b[start - 1]) {
        return None;
    }
    let body_len = b[start + 1..].iter().position(|&c| c == b'$')?;
    let body = &b[start + 1..start + 1 + body_len];
    if body.first().is_some_and(|c| c.is_ascii_digit())
        || !body.iter().all(|c| c.is_ascii_alphanumeric() || *c == b'_')
    {
        return None;
    }
    let tag = &sql[start..start + body_len + 2];
    let open_end = start + tag.len();
    sql[open_end..].find(tag).map(|n| open_end + n + tag.len())
}

fn span_at(sql: &str, i: usize, d: &Dialect) -> Option<Span> {
    let b = sql.as_bytes();
    let at = |k: usize| b.get(k).copied();
    let unterminated = |end: Option<usize>, wrap: fn(usize) -> Span| Some(end.map_or(Span::Keep(b.len()), wrap));
    match b[i] {
        b'\'' => {
            let e_string = d.escape_string_prefix
                && i > 0
                && matches!(b[i - 1], b'E' | b'e')
                && (i < 2 || !is_ident_byte(b[i - 2]));
            unterminated(quoted_end(b, i, b'\'', d.backslash_in_strings || e_string), Span::Literal)
        }
        b'"' => unterminated(quoted_end(b, i, b'"', d.backslash_in_double_quotes), Span::Keep),
        b'`' => unterminated(quoted_end(b, i, b'`', false), Span::Keep),
        b'$' if d.dollar_quotes => dollar_end(sql, i).map(Span::Literal),
        b'-' if at(i + 1) == Some(b'-')
            && (!d.dash_comment_needs_space || at(i + 2).map_or(true, |c| c.is_ascii_whitespace())) =>
        {
            Some(Span::Comment(line_end(sql, i)))
        }
        b'#' if d.hash_comments => Some(Span::Comment(line_end(sql, i))),
        b'/' if at(i + 1) == Some(b'*') => {
            // MySQL 的 /*! ... */ 会被执行，按正文处理
            if d.executable_comments && at(i + 2) == Some(b'!') {
                return None;
            }
            unterminated(block_end(sql, i, d.nested_comments), Span::Comment)
        }
        _ => None,
    }
}

/// 去掉注释、抹平字符串字面量后的 SQL，供表名扫描使用
fn code_view(sql: &str, d: &Dialect) -> String {
    let mut out = String::with_capacity(sql.len());
    let (mut i, mut copied) = (0, 0);
    while i < sql.len() {
        match span_at(sql, i, d) {
            None => i += 1,
            Some(Span::Keep(end)) => i = end,
            Some(Span::Literal(end)) => {
                out.push_str(&sql[copied..i]);
                out.push_str("''");
                i = end;
                copied = end;
            }
            Some(Span::Comment(end)) => {
                out.push_str(&sql[copied..i]);
                out.push(' ');
                i = end;
                copied = end;
            }
        }
    }
    out.push_str(&sql[copied..]);
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "rule", content = "detail", rename_all = "snake_case")]
pub enum Rejection {
    Empty,
    NotSelect,
    StatementSeparator,
    ForbiddenKeyword(String),
    ExportConstruct,
    TableNotAllowed(String),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Empty => f.write_str("empty query"),
            Rejection::NotSelect => f.write_str("only SELECT queries are allowed"),
            Rejection::StatementSeparator => f.write_str("statement separator ';' is not allowed"),
            Rejection::ForbiddenKeyword(kw) => write!(f, "forbidden keyword '{}'", kw),
            Rejection::ExportConstruct => f.write_str("INTO / export constructs are not allowed"),
            Rejection::TableNotAllowed(t) => write!(f, "table '{}' is not permitted", t),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Rejected(Rejection),
}

impl Verdict {
    #[cfg(test)]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed)
    }
}

pub struct SafetyGate {
    allow_list: AllowList,
}

impl SafetyGate {
    pub fn new(allow_list: AllowList) -> Self {
        Self { allow_list }
    }

    pub fn check(&self, sql: &str) -> Verdict {
        match self.first_violation(sql) {
            Some(rejection) => Verdict::Rejected(rejection),
            None => Verdict::Allowed,
        }
    }

    /// `check` 的 Result 形式
    pub fn ensure(&self, sql: &str) -> Result<()> {
        match self.check(sql) {
            Verdict::Allowed => Ok(()),
            Verdict::Rejected(r) => Err(GateError::UnsafeSql(r)),
        }
    }

    fn first_violation(&self, sql: &str) -> Option<Rejection> {
        if sql.trim().is_empty() {
            return Some(Rejection::Empty);
        }
        if !SELECT_ONLY.is_match(sql) {
            return Some(Rejection::NotSelect);
        }
        if sql.contains(';') {
            return Some(Rejection::StatementSeparator);
        }
        if let Some(m) = WRITE_KEYWORDS.find(sql) {
            return Some(Rejection::ForbiddenKeyword(m.as_str().to_lowercase()));
        }
        if EXPORT_CONSTRUCTS.is_match(sql) {
            return Some(Rejection::ExportConstruct);
        }
        DIALECTS
            .iter()
            .find_map(|d| self.unlisted_table(&code_view(sql, d)))
            .map(Rejection::TableNotAllowed)
    }

    /// 每个 FROM / JOIN 之后的整个表列表都要逐项检查
    fn unlisted_table(&self, code: &str) -> Option<String> {
        for kw in TABLE_KEYWORD.find_iter(code) {
            let rest = &code[kw.end()..];
            let end = CLAUSE_END.find(rest).map_or(rest.len(), |m| m.start());
            let list = &rest[..end];
            if list.trim().is_empty() {
                // 子查询或缺少表名
                return Some(rest.split_whitespace().next().unwrap_or_default().to_lowercase());
            }
            if let Some(bad) = list.split(',').find_map(|item| self.item_violation(item)) {
                return Some(bad);
            }
        }
        None
    }

    /// 只接受 `schema.table [[AS] alias]`
    fn item_violation(&self, item: &str) -> Option<String> {
        let tokens: Vec<&str> = item.split_whitespace().collect();
        let (table, alias) = match tokens.as_slice() {
            [table] => (*table, None),
            [table, alias] => (*table, Some(*alias)),
            [table, kw, alias] if kw.eq_ignore_ascii_case("as") => (*table, Some(*alias)),
            _ => return Some(item.trim().to_lowercase()),
        };
        if !QUALIFIED_NAME.is_match(table) || !self.allow_list.contains_ignore_case(table) {
            return Some(table.to_lowercase());
        }
        if alias.is_some_and(|a| !BARE_IDENT.is_match(a)) {
            return Some(item.trim().to_lowercase());
        }
        None
    }
}
