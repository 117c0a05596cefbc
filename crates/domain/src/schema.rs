use serde::{Deserialize, Serialize};

use crate::{
    error::{DirectoryError, Result},
    filter::is_well_formed,
    types::AttributeName,
};

/// The attribute names the resolution engine and the default mapper read.
#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
pub struct AttributeMapping {
    pub distinguished_name: AttributeName,
    pub identity: AttributeName,
    pub account_name: AttributeName,
    pub display_name: AttributeName,
    /// Multi-valued attribute listing the groups an entry belongs to.
    pub groups: AttributeName,
    /// Attribute of a group entry that the values of `groups` refer to.
    pub group_reference: AttributeName,
    /// Relative identifier of the entry's primary group.
    #[serde(default)]
    pub primary_group: Option<AttributeName>,
    /// Attribute holding the full identity the primary group is matched on.
    #[serde(default)]
    pub primary_group_identity: Option<AttributeName>,
    pub user_filter: String,
    pub group_filter: String,
    #[serde(default)]
    pub extra_user_attributes: Vec<AttributeName>,
    #[serde(default)]
    pub extra_group_attributes: Vec<AttributeName>,
}

impl AttributeMapping {
    pub fn active_directory() -> Self {
        Self {
            distinguished_name: "distinguishedName".into(),
            identity: "objectSid".into(),
            account_name: "sAMAccountName".into(),
            display_name: "displayName".into(),
            groups: "memberOf".into(),
            group_reference: "distinguishedName".into(),
            primary_group: Some("primaryGroupID".into()),
            primary_group_identity: Some("objectSid".into()),
            user_filter: "(&(objectCategory=person)(objectClass=user))".to_owned(),
            group_filter: "(objectClass=group)".to_owned(),
            extra_user_attributes: Vec::new(),
            extra_group_attributes: Vec::new(),
        }
    }

    /// RFC 2307bis layout with the `memberOf` overlay. The primary group is
    /// matched on `gidNumber`, which carries no authority prefix.
    pub fn rfc2307() -> Self {
        Self {
            distinguished_name: "entryDN".into(),
            identity: "entryUUID".into(),
            account_name: "uid".into(),
            display_name: "cn".into(),
            groups: "memberOf".into(),
            group_reference: "entryDN".into(),
            primary_group: Some("gidNumber".into()),
            primary_group_identity: Some("gidNumber".into()),
            user_filter: "(objectClass=posixAccount)".to_owned(),
            group_filter: "(objectClass=posixGroup)".to_owned(),
            extra_user_attributes: Vec::new(),
            extra_group_attributes: Vec::new(),
        }
    }

    /// Whether the values of the groups attribute are distinguished names.
    pub fn group_reference_is_dn(&self) -> bool {
        self.group_reference == self.distinguished_name
    }

    /// Attributes to request when fetching an entry to be resolved as a group.
    pub fn group_attributes(&self) -> Vec<AttributeName> {
        self.base_attributes()
            .chain(self.extra_group_attributes.iter().cloned())
            .collect()
    }

    /// Attributes to request when fetching an entry to be resolved as a user.
    pub fn user_attributes(&self) -> Vec<AttributeName> {
        self.base_attributes()
            .chain(self.extra_user_attributes.iter().cloned())
            .collect()
    }

    fn base_attributes(&self) -> impl Iterator<Item = AttributeName> + '_ {
        let mut attributes: Vec<AttributeName> = vec![
            self.distinguished_name.clone(),
            self.identity.clone(),
            self.account_name.clone(),
            self.display_name.clone(),
            self.groups.clone(),
            self.group_reference.clone(),
        ];
        attributes.extend(self.primary_group.iter().cloned());
        attributes.extend(self.primary_group_identity.iter().cloned());
        let mut seen = std::collections::HashSet::new();
        attributes.into_iter().filter(move |a| seen.insert(a.clone()))
    }

    pub fn validate(&self) -> Result<()> {
        for (field, name) in [
            ("distinguished_name", &self.distinguished_name),
            ("identity", &self.identity),
            ("account_name", &self.account_name),
            ("display_name", &self.display_name),
            ("groups", &self.groups),
            ("group_reference", &self.group_reference),
        ] {
            if name.as_str().trim().is_empty() {
                return Err(DirectoryError::Configuration(format!(
                    "attribute mapping `{field}` must not be empty"
                )));
            }
        }
        match (&self.primary_group, &self.primary_group_identity) {
            (Some(_), None) => {
                return Err(DirectoryError::Configuration(
                    "`primary_group` requires `primary_group_identity`".to_owned(),
                ))
            }
            (Some(a), _) | (_, Some(a)) if a.as_str().trim().is_empty() => {
                return Err(DirectoryError::Configuration(
                    "primary group attributes must not be empty".to_owned(),
                ))
            }
            _ => {}
        }
        for (field, filter) in [
            ("user_filter", &self.user_filter),
            ("group_filter", &self.group_filter),
        ] {
            if !is_well_formed(filter) {
                return Err(DirectoryError::Configuration(format!(
                    "`{field}` is not a well-formed filter: {filter:?}"
                )));
            }
        }
        Ok(())
    }
}

impl Default for AttributeMapping {
    fn default() -> Self {
        Self::active_directory()
    }
}

/// Which attribute mapping a deployment uses.
#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DirectorySchema {
    #[default]
    ActiveDirectory,
    Rfc2307,
    Custom(AttributeMapping),
}

impl DirectorySchema {
    pub fn attribute_mapping(&self) -> AttributeMapping {
        match self {
            DirectorySchema::ActiveDirectory => AttributeMapping::active_directory(),
            DirectorySchema::Rfc2307 => AttributeMapping::rfc2307(),
            DirectorySchema::Custom(mapping) => mapping.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_presets_are_valid() {
        AttributeMapping::active_directory().validate().unwrap();
        AttributeMapping::rfc2307().validate().unwrap();
    }

    #[test]
    fn test_group_attributes_are_deduplicated() {
        let mapping = AttributeMapping {
            extra_group_attributes: vec!["description".into()],
            ..AttributeMapping::active_directory()
        };
        assert_eq!(
            mapping
                .group_attributes()
                .iter()
                .map(AttributeName::as_str)
                .collect::<Vec<_>>(),
            vec![
                "distinguishedName",
                "objectSid",
                "sAMAccountName",
                "displayName",
                "memberOf",
                "primaryGroupID",
                "description",
            ]
        );
    }

    #[test]
    fn test_validate_rejects_empty_attribute() {
        let mapping = AttributeMapping {
            groups: "".into(),
            ..AttributeMapping::active_directory()
        };
        assert!(matches!(
            mapping.validate(),
            Err(DirectoryError::Configuration(_))
        ));
    }

    #[test]
    fn test_validate_rejects_primary_group_without_identity() {
        let mapping = AttributeMapping {
            primary_group_identity: None,
            ..AttributeMapping::active_directory()
        };
        assert!(mapping.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_broken_filter() {
        let mapping = AttributeMapping {
            group_filter: "(objectClass=group".to_owned(),
            ..AttributeMapping::active_directory()
        };
        assert!(mapping.validate().is_err());
    }

    #[test]
    fn test_schema_deserialization() {
        let schema: DirectorySchema = serde_json::from_str(r#""rfc2307""#).unwrap();
        assert_eq!(schema.attribute_mapping(), AttributeMapping::rfc2307());
        assert!(AttributeMapping::rfc2307().group_reference_is_dn());
    }
}
