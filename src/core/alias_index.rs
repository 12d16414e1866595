use fst::{Map, MapBuilder};
use std::collections::BTreeMap;

/// 小写别名 -> 目标词的静态索引，基于 FST
pub struct AliasIndex {
    index: Map<Vec<u8>>,
    // FST 只存 u64，真实目标词按 id 反查
    targets: Vec<String>,
}

impl AliasIndex {
    pub fn build(pairs: &[(&str, &str)]) -> anyhow::Result<Self> {
        let mut builder = MapBuilder::memory();
        let mut targets: Vec<String> = Vec::new();

        // FST 键必须有序
        let mut data: BTreeMap<String, u64> = BTreeMap::new();

        for (alias, target) in pairs {
            let id = match targets.iter().position(|t| t == target) {
                Some(pos) => pos as u64,
                None => {
                    targets.push(target.to_string());
                    (targets.len() - 1) as u64
                }
            };
            data.insert(alias.trim().to_lowercase(), id);
        }

        for (key, id) in data {
            builder.insert(key, id)?;
        }

        let bytes = builder.into_inner()?;
        Ok(Self {
            index: Map::new(bytes)?,
            targets,
        })
    }

    /// 调用方负责先做小写与空白规整
    pub fn get(&self, key: &str) -> Option<&str> {
        let id = self.index.get(key)?;
        self.targets.get(id as usize).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_keyed_by_lowercased_alias() {
        let index = AliasIndex::build(&[
            ("Users", "feature_users"),
            ("feature", "feature_name"),
            ("users_total", "feature_users"),
        ])
        .unwrap();
        assert_eq!(index.get("users"), Some("feature_users"));
        assert_eq!(index.get("users_total"), Some("feature_users"));
        assert_eq!(index.get("feature"), Some("feature_name"));
        assert_eq!(index.get("Users"), None);
        assert_eq!(index.get("missing"), None);
    }

    #[test]
    fn later_duplicate_alias_wins() {
        let index = AliasIndex::build(&[("month", "month"), ("month", "signup_month")]).unwrap();
        assert_eq!(index.get("month"), Some("signup_month"));
    }
}
