use std::{cmp::Ordering, collections::BTreeMap};

use serde::{Deserialize, Serialize};

use crate::{filter::SearchFilter, schema::AttributeMapping};

fn compare_str_case_insensitive(s1: &str, s2: &str) -> Ordering {
    let mut it_1 = s1.chars().flat_map(|c| c.to_lowercase());
    let mut it_2 = s2.chars().flat_map(|c| c.to_lowercase());
    loop {
        match (it_1.next(), it_2.next()) {
            (Some(c1), Some(c2)) => {
                let o = c1.cmp(&c2);
                if o != Ordering::Equal {
                    return o;
                }
            }
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (None, None) => return Ordering::Equal,
        }
    }
}

/// Defines a string newtype that keeps the original spelling for display but
/// compares, orders and hashes case-insensitively.
macro_rules! make_case_insensitive_comparable_string {
    ($c:ident) => {
        #[derive(
            Clone, Default, Serialize, Deserialize, derive_more::Debug, derive_more::Display,
        )]
        #[serde(from = "String", into = "String")]
        #[debug(r#""{_0}""#)]
        #[display("{_0}")]
        pub struct $c(String);

        impl PartialEq for $c {
            fn eq(&self, other: &Self) -> bool {
                compare_str_case_insensitive(&self.0, &other.0) == Ordering::Equal
            }
        }

        impl Eq for $c {}

        impl PartialOrd for $c {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $c {
            fn cmp(&self, other: &Self) -> Ordering {
                compare_str_case_insensitive(&self.0, &other.0)
            }
        }

        impl std::hash::Hash for $c {
            fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
                self.0.to_lowercase().hash(state)
            }
        }

        impl $c {
            pub fn new(raw: &str) -> Self {
                Self(raw.to_owned())
            }

            pub fn as_str(&self) -> &str {
                self.0.as_str()
            }

            pub fn into_string(self) -> String {
                self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl From<String> for $c {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $c {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }

        impl From<$c> for String {
            fn from(value: $c) -> Self {
                value.0
            }
        }
    };
}

make_case_insensitive_comparable_string!(AttributeName);
// Distinguished names: AD and OpenLDAP both match them case-insensitively.
make_case_insensitive_comparable_string!(Dn);

/// A directory record as returned by a gateway: a DN plus multi-valued
/// attributes, already converted to their string form.
pub trait RawEntry: Clone + Send + Sync + 'static {
    fn distinguished_name(&self) -> &str;

    fn attribute_values(&self, name: &AttributeName) -> Option<&[String]>;

    fn first_value(&self, name: &AttributeName) -> Option<&str> {
        self.attribute_values(name)
            .and_then(|values| values.first())
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    fn dn(&self) -> Dn {
        Dn::new(self.distinguished_name())
    }

    /// Filters under which this entry can be found again: by DN, identity and
    /// account name, skipping the ones that are empty.
    fn cache_keys(&self, mapping: &AttributeMapping) -> Vec<String> {
        let dn = Some(self.distinguished_name()).filter(|dn| !dn.is_empty());
        make_cache_keys(
            mapping,
            dn,
            self.first_value(&mapping.identity),
            self.first_value(&mapping.account_name),
        )
    }
}

/// A mapped user or group.
pub trait DirectoryObject: Clone + Send + Sync + 'static {
    fn distinguished_name(&self) -> &Dn;

    fn identity(&self) -> Option<&str>;

    fn account_name(&self) -> Option<&str>;

    fn cache_keys(&self, mapping: &AttributeMapping) -> Vec<String> {
        let dn = Some(self.distinguished_name().as_str()).filter(|dn| !dn.is_empty());
        make_cache_keys(mapping, dn, self.identity(), self.account_name())
    }
}

fn make_cache_keys(
    mapping: &AttributeMapping,
    dn: Option<&str>,
    identity: Option<&str>,
    account_name: Option<&str>,
) -> Vec<String> {
    [
        (&mapping.distinguished_name, dn),
        (&mapping.identity, identity),
        (&mapping.account_name, account_name),
    ]
    .into_iter()
    .filter_map(|(attribute, value)| {
        value
            .filter(|v| !v.is_empty())
            .map(|v| SearchFilter::equality(attribute.clone(), v).to_string())
    })
    .collect()
}

#[derive(PartialEq, Eq, Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub dn: String,
    pub attributes: BTreeMap<AttributeName, Vec<String>>,
}

impl DirectoryEntry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes
            .entry(AttributeName::from(name))
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }
}

impl RawEntry for DirectoryEntry {
    fn distinguished_name(&self) -> &str {
        &self.dn
    }

    fn attribute_values(&self, name: &AttributeName) -> Option<&[String]> {
        self.attributes.get(name).map(Vec::as_slice)
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Default, Serialize, Deserialize)]
pub struct Group {
    pub dn: Dn,
    pub identity: Option<String>,
    pub account_name: Option<String>,
    pub display_name: Option<String>,
    /// Set when the group was reached through the subject's primary group
    /// attribute rather than its membership list.
    pub is_primary: bool,
    /// Groups this group is itself a member of, when resolved.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub parent_groups: Vec<Group>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub attributes: BTreeMap<AttributeName, Vec<String>>,
}

impl DirectoryObject for Group {
    fn distinguished_name(&self) -> &Dn {
        &self.dn
    }

    fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    fn account_name(&self) -> Option<&str> {
        self.account_name.as_deref()
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Default, Serialize, Deserialize)]
pub struct User {
    pub dn: Dn,
    pub identity: Option<String>,
    pub account_name: Option<String>,
    pub display_name: Option<String>,
    pub groups: Vec<Group>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub attributes: BTreeMap<AttributeName, Vec<String>>,
}

impl DirectoryObject for User {
    fn distinguished_name(&self) -> &Dn {
        &self.dn
    }

    fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    fn account_name(&self) -> Option<&str> {
        self.account_name.as_deref()
    }
}
