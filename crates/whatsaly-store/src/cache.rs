use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use whatsaly_protocol::SessionId;

use crate::error::{CacheError, CacheResult};

/// External key-value cache holding session-scoped entries.
///
/// Patterns use Redis glob syntax: `*` matches any run of characters, `?`
/// matches one character and `\` escapes the next character.
#[async_trait]
pub trait SessionCache: Send + Sync {
    /// Deletes every key matching `pattern`, returning how many were removed.
    async fn delete_matching(&self, pattern: &str) -> CacheResult<usize>;
}

pub struct CacheKeys;

impl CacheKeys {
    pub fn reset_patterns(identity: &SessionId) -> Vec<String> {
        let escaped = escape_glob(identity.as_str());
        vec![format!("session:{escaped}"), format!("session:{escaped}:*")]
    }

    pub fn clear_patterns(identity: &SessionId) -> Vec<String> {
        let mut patterns = Self::reset_patterns(identity);
        patterns.push(format!("{}:*", escape_glob(identity.as_str())));
        patterns
    }
}

pub fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

pub fn glob_matches(pattern: &str, candidate: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let candidate: Vec<char> = candidate.chars().collect();
    matches_from(&pattern, &candidate)
}

fn matches_from(pattern: &[char], candidate: &[char]) -> bool {
    match pattern.split_first() {
        None => candidate.is_empty(),
        Some((&'*', rest)) => {
            (0..=candidate.len()).any(|skip| matches_from(rest, &candidate[skip..]))
        }
        Some((&'?', rest)) => !candidate.is_empty() && matches_from(rest, &candidate[1..]),
        Some((&'\\', rest)) if !rest.is_empty() => {
            candidate.first() == Some(&rest[0]) && matches_from(&rest[1..], &candidate[1..])
        }
        Some((literal, rest)) => {
            candidate.first() == Some(literal) && matches_from(rest, &candidate[1..])
        }
    }
}

/// Process-local cache used when no Redis endpoint is configured, and by tests.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: Mutex<BTreeMap<String, String>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) -> CacheResult<()> {
        self.entries()?.insert(key.into(), value.into());
        Ok(())
    }

    pub fn get(&self, key: &str) -> CacheResult<Option<String>> {
        Ok(self.entries()?.get(key).cloned())
    }

    pub fn keys_matching(&self, pattern: &str) -> CacheResult<Vec<String>> {
        Ok(self
            .entries()?
            .keys()
            .filter(|key| glob_matches(pattern, key))
            .cloned()
            .collect())
    }

    pub fn len(&self) -> usize {
        self.entries().map(|entries| entries.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> CacheResult<std::sync::MutexGuard<'_, BTreeMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|_| CacheError::Unavailable("in-memory cache lock poisoned".to_owned()))
    }
}

#[async_trait]
impl SessionCache for InMemoryCache {
    async fn delete_matching(&self, pattern: &str) -> CacheResult<usize> {
        let mut entries = self.entries()?;
        let before = entries.len();
        entries.retain(|key, _| !glob_matches(pattern, key));
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use whatsaly_protocol::SessionId;

    use super::*;

    #[test]
    fn glob_matching_follows_redis_rules() {
        assert!(glob_matches("session:123:*", "session:123:keys"));
        assert!(glob_matches("session:123:*", "session:123:"));
        assert!(!glob_matches("session:123:*", "session:1234:keys"));
        assert!(glob_matches("s?ssion", "session"));
        assert!(glob_matches("a\\*b", "a*b"));
        assert!(!glob_matches("a\\*b", "axb"));
    }

    #[test]
    fn patterns_do_not_bleed_into_longer_identities() {
        let identity = SessionId::new("1555");
        let patterns = CacheKeys::clear_patterns(&identity);

        for key in ["session:1555", "session:1555:pre-keys", "1555:contacts"] {
            assert!(
                patterns.iter().any(|pattern| glob_matches(pattern, key)),
                "{key} should match"
            );
        }
        for key in ["session:15550", "session:15550:pre-keys", "15550:contacts"] {
            assert!(
                !patterns.iter().any(|pattern| glob_matches(pattern, key)),
                "{key} should not match"
            );
        }
    }

    #[test]
    fn identities_with_glob_characters_are_escaped() {
        let identity = SessionId::new("a*");
        let patterns = CacheKeys::reset_patterns(&identity);
        assert!(patterns.iter().any(|pattern| glob_matches(pattern, "session:a*")));
        assert!(!patterns.iter().any(|pattern| glob_matches(pattern, "session:abc")));
    }

    #[tokio::test]
    async fn in_memory_delete_matching_removes_only_matches() {
        let cache = InMemoryCache::new();
        cache.set("session:1:a", "x").expect("set");
        cache.set("session:1:b", "x").expect("set");
        cache.set("session:2:a", "x").expect("set");

        let removed = cache
            .delete_matching("session:1:*")
            .await
            .expect("delete matching");

        assert_eq!(removed, 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("session:2:a").expect("get"), Some("x".to_owned()));
    }
}
