use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use dirsearch_cache::{BulkQueryKey, Lookup};
use dirsearch_domain::{
    error::{DirectoryError, Result},
    filter::SearchFilter,
    options::LdapOptions,
    schema::AttributeMapping,
    types::{AttributeName, Dn, RawEntry},
};
use dirsearch_domain_handlers::handler::{DirectoryGateway, EntryMapper, SearchOptions};
use tracing::{debug, instrument, warn};

use crate::{merge_attributes, ServiceCaches};

/// Builds the identity of a subject's primary group from the subject's own
/// identity and the primary group's relative id.
///
/// The authority prefix is everything before the last `-` of
/// `subject_identity`; without one the relative id is used alone. A relative
/// id that is not a number yields `None`.
pub fn primary_group_identity(subject_identity: Option<&str>, rid: &str) -> Option<String> {
    let rid = rid.trim();
    if rid.parse::<u32>().is_err() {
        warn!(rid, "Ignoring malformed primary group id");
        return None;
    }
    let prefix = subject_identity
        .and_then(|identity| identity.rfind('-').map(|pos| &identity[..pos]))
        .filter(|prefix| !prefix.is_empty());
    Some(match prefix {
        Some(prefix) => format!("{prefix}-{rid}"),
        None => rid.to_owned(),
    })
}

/// What kind of entry memberships are resolved for. Only users have a
/// primary group; groups are terminal for that step.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum Subject {
    User,
    Group,
}

/// A group reached while resolving a subject.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct ResolvedGroup<E> {
    pub entry: E,
    pub is_primary: bool,
    /// Direct parents of the group, only filled in when the hierarchy was
    /// requested.
    pub parents: Vec<E>,
}

impl<E> ResolvedGroup<E> {
    fn new(entry: E, is_primary: bool) -> Self {
        Self {
            entry,
            is_primary,
            parents: Vec::new(),
        }
    }
}

/// Finds the groups a user or group entry belongs to.
///
/// Every group is reported at most once per resolution, keyed by DN. Lookups
/// go through the entry cache first; direct memberships that miss are
/// fetched with a single combined query.
pub struct GroupResolver<G, M>
where
    G: DirectoryGateway,
    M: EntryMapper<G::Entry>,
{
    gateway: Arc<G>,
    mapper: Arc<M>,
    caches: Arc<ServiceCaches<G, M>>,
    mapping: Arc<AttributeMapping>,
    group_attributes: Vec<AttributeName>,
    is_recursive: bool,
    max_group_expansion: usize,
}

impl<G, M> GroupResolver<G, M>
where
    G: DirectoryGateway,
    M: EntryMapper<G::Entry>,
{
    pub fn new(
        gateway: Arc<G>,
        mapper: Arc<M>,
        caches: Arc<ServiceCaches<G, M>>,
        options: &LdapOptions,
    ) -> Result<Self> {
        options.validate()?;
        let mapping = Arc::new(options.attribute_mapping());
        let group_attributes =
            merge_attributes(mapping.group_attributes(), mapper.required_group_attributes());
        Ok(Self {
            gateway,
            mapper,
            caches,
            mapping,
            group_attributes,
            is_recursive: options.is_recursive_group_membership,
            max_group_expansion: options.max_group_expansion,
        })
    }

    pub fn mapping(&self) -> &AttributeMapping {
        &self.mapping
    }

    /// Raw entries of the groups the user `entry` belongs to, primary group
    /// first.
    pub async fn resolve_group_entries(&self, entry: &G::Entry) -> Result<Vec<G::Entry>> {
        Ok(self
            .resolve(entry, Subject::User, false)
            .await?
            .into_iter()
            .map(|group| group.entry)
            .collect())
    }

    /// Mapped groups the user `entry` belongs to, with their parents attached
    /// when the mapper supports it.
    pub async fn resolve_groups(&self, entry: &G::Entry) -> Result<Vec<M::Group>> {
        self.resolve_mapped(entry, Subject::User).await
    }

    /// Mapped groups the group `entry` is a member of.
    pub async fn resolve_parent_groups(&self, entry: &G::Entry) -> Result<Vec<M::Group>> {
        self.resolve_mapped(entry, Subject::Group).await
    }

    async fn resolve_mapped(&self, entry: &G::Entry, subject: Subject) -> Result<Vec<M::Group>> {
        let hierarchical = self.mapper.group_is_group_member();
        let resolved = self.resolve(entry, subject, hierarchical).await?;
        Ok(resolved
            .into_iter()
            .map(|group| self.map_resolved(group, hierarchical))
            .collect())
    }

    fn map_resolved(&self, resolved: ResolvedGroup<G::Entry>, hierarchical: bool) -> M::Group {
        let mut group = if resolved.is_primary {
            self.mapper.map_primary_group(&resolved.entry)
        } else {
            self.mapper.map_group(&resolved.entry)
        };
        if hierarchical {
            let parents = resolved
                .parents
                .iter()
                .map(|parent| self.mapper.map_group(parent))
                .collect();
            self.mapper.set_group_parents(&mut group, parents);
        }
        group
    }

    #[instrument(skip_all, level = "debug", fields(dn = entry.distinguished_name()))]
    pub async fn resolve(
        &self,
        entry: &G::Entry,
        subject: Subject,
        with_parents: bool,
    ) -> Result<Vec<ResolvedGroup<G::Entry>>> {
        let primary = match subject {
            Subject::User => self
                .primary_group_entry(entry)
                .await?
                .filter(|primary| primary.dn() != entry.dn()),
            Subject::Group => None,
        };
        let references = self.direct_references(entry);
        let found = self.fetch_referenced(&references).await?;

        let mut known = HashSet::new();
        let mut groups = Vec::new();
        if let Some(primary) = primary {
            known.insert(primary.dn());
            groups.push(ResolvedGroup::new(primary, true));
        }
        for group in self.in_reference_order(&references, &found) {
            if known.insert(group.dn()) {
                groups.push(ResolvedGroup::new(group, false));
            }
        }

        if self.is_recursive {
            self.expand(entry, groups, known, with_parents).await
        } else if with_parents {
            self.attach_parents(groups).await
        } else {
            Ok(groups)
        }
    }

    async fn primary_group_entry(&self, entry: &G::Entry) -> Result<Option<G::Entry>> {
        let (Some(rid_attribute), Some(identity_attribute)) = (
            &self.mapping.primary_group,
            &self.mapping.primary_group_identity,
        ) else {
            return Ok(None);
        };
        let Some(rid) = entry.first_value(rid_attribute) else {
            return Ok(None);
        };
        let Some(identity) =
            primary_group_identity(entry.first_value(identity_attribute), rid)
        else {
            return Ok(None);
        };
        let filter = SearchFilter::equality(identity_attribute.clone(), identity);
        let key = filter.to_string();
        let query = filter.merged_with_base(&self.mapping.group_filter);
        let gateway = &self.gateway;
        let attributes = &self.group_attributes;
        let primary = self
            .caches
            .entries
            .get_or_add_remembering_absence(&key, |_| async move {
                gateway.search_single(&query, attributes).await
            })
            .await?;
        if primary.is_none() {
            debug!(%key, "Primary group not found");
        }
        Ok(primary)
    }

    fn direct_references(&self, entry: &G::Entry) -> Vec<String> {
        dedup_references(
            entry
                .attribute_values(&self.mapping.groups)
                .unwrap_or_default()
                .iter()
                .cloned(),
        )
    }

    fn reference_filter(&self, reference: &str) -> SearchFilter {
        SearchFilter::equality(self.mapping.group_reference.clone(), reference)
    }

    fn reference_of<'a>(&self, entry: &'a G::Entry) -> Option<&'a str> {
        if self.mapping.group_reference_is_dn() {
            Some(entry.distinguished_name()).filter(|dn| !dn.is_empty())
        } else {
            entry.first_value(&self.mapping.group_reference)
        }
    }

    /// Looks up the group entries that `references` point to, keyed by
    /// reference. Cached entries are used as is; the rest is fetched with
    /// one query.
    async fn fetch_referenced(&self, references: &[String]) -> Result<HashMap<Dn, G::Entry>> {
        let mut found = HashMap::new();
        let mut missing = Vec::new();
        for reference in references {
            let key = self.reference_filter(reference).to_string();
            match self.caches.entries.lookup(&key)? {
                Lookup::Hit(entry) => {
                    found.insert(Dn::new(reference), entry);
                }
                Lookup::KnownAbsent => {}
                Lookup::Miss => missing.push(reference.as_str()),
            }
        }
        if missing.is_empty() {
            return Ok(found);
        }
        let filter = SearchFilter::any_of(missing.iter().map(|r| self.reference_filter(r)))
            .merged_with_base(&self.mapping.group_filter);
        let key = BulkQueryKey::new(&filter, &self.group_attributes);
        let gateway = &self.gateway;
        let attributes = &self.group_attributes;
        let entries = self
            .caches
            .bulk
            .get_or_add(key, |_| async move {
                gateway
                    .search(&filter, attributes, &SearchOptions::default())
                    .await
            })
            .await?;
        debug!(
            requested = missing.len(),
            found = entries.len(),
            "Fetched group entries"
        );
        for entry in entries.iter() {
            let Some(reference) = self.reference_of(entry) else {
                continue;
            };
            self.remember(entry, reference);
            found.insert(Dn::new(reference), entry.clone());
        }
        Ok(found)
    }

    fn remember(&self, entry: &G::Entry, reference: &str) {
        let mut stored = self.caches.entries.add(entry);
        if stored.is_ok() && !self.mapping.group_reference_is_dn() {
            stored = self
                .caches
                .entries
                .insert(&self.reference_filter(reference).to_string(), entry);
        }
        if let Err(error) = stored {
            debug!(%error, dn = entry.distinguished_name(), "Group entry not cached");
        }
    }

    /// The entries of `references` that were found, in reference order and
    /// without duplicate DNs.
    fn in_reference_order(
        &self,
        references: &[String],
        found: &HashMap<Dn, G::Entry>,
    ) -> Vec<G::Entry> {
        let mut seen = HashSet::new();
        references
            .iter()
            .filter_map(|reference| {
                let entry = found.get(&Dn::new(reference));
                if entry.is_none() {
                    debug!(reference, "Skipping unresolved group reference");
                }
                entry
            })
            .filter(|entry| seen.insert(entry.dn()))
            .cloned()
            .collect()
    }

    /// Attaches one level of parents to every group, with one combined
    /// lookup for all of them.
    async fn attach_parents(
        &self,
        mut groups: Vec<ResolvedGroup<G::Entry>>,
    ) -> Result<Vec<ResolvedGroup<G::Entry>>> {
        let references: Vec<Vec<String>> = groups
            .iter()
            .map(|group| self.direct_references(&group.entry))
            .collect();
        let all = dedup_references(references.iter().flatten().cloned());
        let found = self.fetch_referenced(&all).await?;
        for (group, references) in groups.iter_mut().zip(&references) {
            group.parents = self.in_reference_order(references, &found);
        }
        Ok(groups)
    }

    /// Depth-first expansion of `seeds`. A group whose DN is already known is
    /// never queried nor descended into again, which also breaks cycles.
    async fn expand(
        &self,
        subject: &G::Entry,
        seeds: Vec<ResolvedGroup<G::Entry>>,
        mut known: HashSet<Dn>,
        with_parents: bool,
    ) -> Result<Vec<ResolvedGroup<G::Entry>>> {
        self.check_expansion(subject, known.len())?;
        let mut visited: HashMap<Dn, G::Entry> = seeds
            .iter()
            .map(|group| (group.entry.dn(), group.entry.clone()))
            .collect();
        let mut stack = seeds;
        stack.reverse();
        let mut groups = Vec::new();
        while let Some(mut group) = stack.pop() {
            let references = self.direct_references(&group.entry);
            let unknown: Vec<String> = if self.mapping.group_reference_is_dn() {
                references
                    .iter()
                    .filter(|reference| !known.contains(&Dn::new(reference)))
                    .cloned()
                    .collect()
            } else {
                references.clone()
            };
            let mut found = self.fetch_referenced(&unknown).await?;
            for reference in &references {
                let dn = Dn::new(reference);
                if let Some(entry) = visited.get(&dn) {
                    found.entry(dn).or_insert_with(|| entry.clone());
                }
            }
            let parents = self.in_reference_order(&references, &found);
            let mut discovered = Vec::new();
            for parent in &parents {
                if known.insert(parent.dn()) {
                    self.check_expansion(subject, known.len())?;
                    visited.insert(parent.dn(), parent.clone());
                    discovered.push(ResolvedGroup::new(parent.clone(), false));
                }
            }
            stack.extend(discovered.into_iter().rev());
            if with_parents {
                group.parents = parents;
            }
            groups.push(group);
        }
        debug!(count = groups.len(), "Expanded group membership");
        Ok(groups)
    }

    fn check_expansion(&self, subject: &G::Entry, count: usize) -> Result<()> {
        if count > self.max_group_expansion {
            warn!(
                dn = subject.distinguished_name(),
                limit = self.max_group_expansion,
                "Group expansion limit reached"
            );
            return Err(DirectoryError::RecursionLimitExceeded {
                dn: subject.distinguished_name().to_owned(),
                limit: self.max_group_expansion,
            });
        }
        Ok(())
    }
}

fn dedup_references(references: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    references
        .filter(|reference| !reference.trim().is_empty())
        .filter(|reference| seen.insert(Dn::new(reference)))
        .collect()
}
