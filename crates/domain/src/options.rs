use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    error::{DirectoryError, Result},
    schema::{AttributeMapping, DirectorySchema},
};

#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CachingMode {
    /// Nothing is stored, every lookup misses.
    None,
    /// Entries expire a fixed duration after they were stored.
    FixedExpiration,
    /// Entries expire once they have not been read for the configured duration.
    #[default]
    SlidingExpiration,
}

#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize, derive_builder::Builder)]
#[builder(pattern = "owned")]
pub struct CachingOptions {
    #[builder(default)]
    #[serde(default)]
    pub mode: CachingMode,
    #[builder(default = "300")]
    #[serde(default = "default_cache_duration_seconds")]
    pub duration_seconds: u64,
}

fn default_cache_duration_seconds() -> u64 {
    300
}

impl CachingOptions {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_seconds)
    }

    pub fn disabled() -> Self {
        Self {
            mode: CachingMode::None,
            duration_seconds: 0,
        }
    }
}

impl std::default::Default for CachingOptions {
    fn default() -> Self {
        CachingOptionsBuilder::default().build().unwrap()
    }
}

/// Options shared by the caches, the group resolver and the search service.
#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize, derive_builder::Builder)]
#[builder(pattern = "owned")]
#[serde(default)]
pub struct LdapOptions {
    #[builder(default)]
    pub schema: DirectorySchema,
    #[builder(default = "false")]
    pub is_recursive_group_membership: bool,
    #[builder(default)]
    pub caching: CachingOptions,
    /// Upper bound on the number of distinct groups a single resolution may
    /// visit before giving up.
    #[builder(default = "1000")]
    pub max_group_expansion: usize,
}

impl std::default::Default for LdapOptions {
    fn default() -> Self {
        LdapOptionsBuilder::default().build().unwrap()
    }
}

impl LdapOptions {
    pub fn attribute_mapping(&self) -> AttributeMapping {
        self.schema.attribute_mapping()
    }

    pub fn validate(&self) -> Result<()> {
        self.attribute_mapping().validate()?;
        if self.max_group_expansion == 0 {
            return Err(DirectoryError::Configuration(
                "`max_group_expansion` must be at least 1".to_owned(),
            ));
        }
        if self.caching.mode != CachingMode::None && self.caching.duration_seconds == 0 {
            return Err(DirectoryError::Configuration(
                "caching is enabled but `caching.duration_seconds` is 0".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let options = LdapOptions::default();
        assert_eq!(options.schema, DirectorySchema::ActiveDirectory);
        assert!(!options.is_recursive_group_membership);
        assert_eq!(options.caching.mode, CachingMode::SlidingExpiration);
        assert_eq!(options.caching.duration(), Duration::from_secs(300));
        options.validate().unwrap();
    }

    #[test]
    fn test_builder() {
        let options = LdapOptionsBuilder::default()
            .schema(DirectorySchema::Rfc2307)
            .is_recursive_group_membership(true)
            .caching(CachingOptions::disabled())
            .build()
            .unwrap();
        assert_eq!(options.attribute_mapping(), AttributeMapping::rfc2307());
        options.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_zero_duration() {
        let options = LdapOptionsBuilder::default()
            .caching(CachingOptions {
                mode: CachingMode::FixedExpiration,
                duration_seconds: 0,
            })
            .build()
            .unwrap();
        assert!(matches!(
            options.validate(),
            Err(DirectoryError::Configuration(_))
        ));
    }

    #[test]
    fn test_deserialize_partial() {
        let options: LdapOptions = serde_json::from_str(
            r#"{"is_recursive_group_membership": true, "caching": {"mode": "fixed_expiration"}}"#,
        )
        .unwrap();
        assert!(options.is_recursive_group_membership);
        assert_eq!(options.caching.mode, CachingMode::FixedExpiration);
        assert_eq!(options.caching.duration_seconds, 300);
        assert_eq!(options.max_group_expansion, 1000);
    }
}
