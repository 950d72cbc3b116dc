//! Declarative session configuration.

use serde::{Deserialize, Serialize};

use crate::hierarchy::{ChildCachePolicy, TransferSources};

/// Child cache policy selectable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildPolicyKind {
    /// See [`ChildCachePolicy::Fresh`].
    Fresh,
    /// See [`ChildCachePolicy::Singleton`].
    #[default]
    Singleton,
    /// See [`ChildCachePolicy::Transfer`].
    Transfer,
}

impl ChildPolicyKind {
    /// Build the policy, using `sources` if the kind is `Transfer`.
    pub fn into_policy(self, sources: TransferSources) -> ChildCachePolicy {
        match self {
            ChildPolicyKind::Fresh => ChildCachePolicy::Fresh,
            ChildPolicyKind::Singleton => ChildCachePolicy::Singleton,
            ChildPolicyKind::Transfer => ChildCachePolicy::Transfer(sources),
        }
    }
}

/// Settings applied to a session and all of its children.
///
/// ```
/// use feature_flow::{CacheConfig, ChildPolicyKind};
///
/// let config: CacheConfig = serde_json::from_str(r#"{ "child_policy": "fresh" }"#).unwrap();
/// assert_eq!(config.child_policy, ChildPolicyKind::Fresh);
/// assert!(config.consistency_check);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Policy for child caches.
    pub child_policy: ChildPolicyKind,
    /// Reject computed results requested with a different input than the one
    /// they were computed with.
    pub consistency_check: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            child_policy: ChildPolicyKind::Singleton,
            consistency_check: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_round_trips_through_json() {
        let config = CacheConfig {
            child_policy: ChildPolicyKind::Transfer,
            consistency_check: false,
        };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(json, r#"{"child_policy":"transfer","consistency_check":false}"#);
        let back: CacheConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: CacheConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, CacheConfig::default());
    }

    #[test]
    fn test_kind_builds_policy() {
        let policy = ChildPolicyKind::Transfer.into_policy(TransferSources::new());
        assert!(matches!(policy, ChildCachePolicy::Transfer(ref s) if s.is_empty()));
        assert!(matches!(
            ChildPolicyKind::Fresh.into_policy(TransferSources::new()),
            ChildCachePolicy::Fresh
        ));
    }
}
