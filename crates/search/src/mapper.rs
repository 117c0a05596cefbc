use std::{collections::BTreeMap, sync::Arc};

use dirsearch_domain::{
    schema::AttributeMapping,
    types::{AttributeName, Group, RawEntry, User},
};
use dirsearch_domain_handlers::handler::EntryMapper;

/// Maps entries onto [`User`] and [`Group`] using the names of an
/// [`AttributeMapping`].
#[derive(Debug, Clone)]
pub struct AttributeMapper {
    mapping: Arc<AttributeMapping>,
    hierarchical: bool,
}

impl AttributeMapper {
    /// A mapper whose groups carry their parent groups.
    pub fn new(mapping: Arc<AttributeMapping>) -> Self {
        Self {
            mapping,
            hierarchical: true,
        }
    }

    /// A mapper whose groups never carry parents.
    pub fn flat(mapping: Arc<AttributeMapping>) -> Self {
        Self {
            mapping,
            hierarchical: false,
        }
    }

    fn extra_attributes<E: RawEntry>(
        entry: &E,
        names: &[AttributeName],
    ) -> BTreeMap<AttributeName, Vec<String>> {
        names
            .iter()
            .filter_map(|name| {
                entry
                    .attribute_values(name)
                    .filter(|values| !values.is_empty())
                    .map(|values| (name.clone(), values.to_vec()))
            })
            .collect()
    }

    fn value<E: RawEntry>(entry: &E, name: &AttributeName) -> Option<String> {
        entry.first_value(name).map(str::to_owned)
    }
}

impl<E: RawEntry> EntryMapper<E> for AttributeMapper {
    type User = User;
    type Group = Group;

    fn map_user(&self, entry: &E) -> User {
        User {
            dn: entry.dn(),
            identity: Self::value(entry, &self.mapping.identity),
            account_name: Self::value(entry, &self.mapping.account_name),
            display_name: Self::value(entry, &self.mapping.display_name),
            groups: Vec::new(),
            attributes: Self::extra_attributes(entry, &self.mapping.extra_user_attributes),
        }
    }

    fn map_group(&self, entry: &E) -> Group {
        Group {
            dn: entry.dn(),
            identity: Self::value(entry, &self.mapping.identity),
            account_name: Self::value(entry, &self.mapping.account_name),
            display_name: Self::value(entry, &self.mapping.display_name),
            is_primary: false,
            parent_groups: Vec::new(),
            attributes: Self::extra_attributes(entry, &self.mapping.extra_group_attributes),
        }
    }

    fn map_primary_group(&self, entry: &E) -> Group {
        Group {
            is_primary: true,
            ..self.map_group(entry)
        }
    }

    fn set_user_groups(&self, user: &mut User, groups: Vec<Group>) {
        user.groups = groups;
    }

    fn set_group_parents(&self, group: &mut Group, parents: Vec<Group>) {
        group.parent_groups = parents;
    }

    fn group_is_group_member(&self) -> bool {
        self.hierarchical
    }

    fn required_user_attributes(&self) -> Vec<AttributeName> {
        self.mapping.user_attributes()
    }

    fn required_group_attributes(&self) -> Vec<AttributeName> {
        self.mapping.group_attributes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirsearch_domain::types::{DirectoryEntry, Dn};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_map_group() {
        let mapping = Arc::new(AttributeMapping {
            extra_group_attributes: vec!["description".into()],
            ..AttributeMapping::active_directory()
        });
        let mapper = AttributeMapper::new(mapping);
        let entry = DirectoryEntry::new("CN=Admins,DC=example,DC=com")
            .with_attribute("objectSid", ["S-1-5-21-1-2-3-512"])
            .with_attribute("sAMAccountName", ["admins"])
            .with_attribute("description", ["Domain admins"]);
        let group = EntryMapper::<DirectoryEntry>::map_primary_group(&mapper, &entry);
        assert_eq!(
            group,
            Group {
                dn: Dn::from("cn=admins,dc=example,dc=com"),
                identity: Some("S-1-5-21-1-2-3-512".to_owned()),
                account_name: Some("admins".to_owned()),
                display_name: None,
                is_primary: true,
                parent_groups: Vec::new(),
                attributes: [("description".into(), vec!["Domain admins".to_owned()])].into(),
            }
        );
    }

    #[test]
    fn test_flat_mapper_is_not_hierarchical() {
        let mapper = AttributeMapper::flat(Arc::new(AttributeMapping::rfc2307()));
        assert!(!EntryMapper::<DirectoryEntry>::group_is_group_member(&mapper));
        let user = EntryMapper::<DirectoryEntry>::map_user(
            &mapper,
            &DirectoryEntry::new("uid=bob,ou=people,dc=example,dc=com")
                .with_attribute("uid", ["bob"])
                .with_attribute("cn", ["Bob Smith"]),
        );
        assert_eq!(user.account_name.as_deref(), Some("bob"));
        assert_eq!(user.display_name.as_deref(), Some("Bob Smith"));
        assert_eq!(user.identity, None);
    }
}
