use std::sync::Arc;

use async_trait::async_trait;
use dirsearch_cache::{BulkQueryKey, ObjectCache, SearchCaches};
use dirsearch_domain::{
    error::{DirectoryError, Result},
    filter::SearchFilter,
    options::LdapOptions,
    schema::AttributeMapping,
    types::{AttributeName, DirectoryObject, RawEntry},
};
use dirsearch_domain_handlers::handler::{
    DirectoryGateway, EntryMapper, GroupSearchHandler, SearchOptions, UserSearchHandler,
};
use tracing::{debug, instrument, warn};

use crate::{group_resolver::GroupResolver, merge_attributes, ServiceCaches};

fn check_argument(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(DirectoryError::InvalidArgument(format!(
            "{name} must not be empty"
        )))
    } else {
        Ok(())
    }
}

fn listing_filter(filter: Option<SearchFilter>, base: &str) -> SearchFilter {
    match filter {
        Some(filter) => filter.merged_with_base(base),
        None => SearchFilter::Raw(base.to_owned()),
    }
}

fn cache_object<T: DirectoryObject>(cache: &ObjectCache<T>, object: &T) {
    if let Err(error) = cache.add(object) {
        debug!(%error, "Object not cached");
    }
}

/// User and group lookups over a directory gateway, with memberships
/// resolved and results cached.
///
/// Single lookups return the first entry in directory order when the filter
/// matches more than one; a warning is logged.
pub struct SearchService<G, M>
where
    G: DirectoryGateway,
    M: EntryMapper<G::Entry>,
{
    gateway: Arc<G>,
    mapper: Arc<M>,
    caches: Arc<ServiceCaches<G, M>>,
    resolver: GroupResolver<G, M>,
    mapping: Arc<AttributeMapping>,
    user_attributes: Vec<AttributeName>,
    group_attributes: Vec<AttributeName>,
}

impl<G, M> SearchService<G, M>
where
    G: DirectoryGateway,
    M: EntryMapper<G::Entry>,
{
    pub fn new(gateway: Arc<G>, mapper: Arc<M>, options: &LdapOptions) -> Result<Self> {
        Self::with_caches(
            gateway,
            mapper,
            Arc::new(SearchCaches::new(options)),
            options,
        )
    }

    /// Builds a service on top of existing caches, e.g. to share them with
    /// another service using the same options.
    pub fn with_caches(
        gateway: Arc<G>,
        mapper: Arc<M>,
        caches: Arc<ServiceCaches<G, M>>,
        options: &LdapOptions,
    ) -> Result<Self> {
        let resolver =
            GroupResolver::new(gateway.clone(), mapper.clone(), caches.clone(), options)?;
        let mapping = Arc::new(resolver.mapping().clone());
        let user_attributes =
            merge_attributes(mapping.user_attributes(), mapper.required_user_attributes());
        let group_attributes =
            merge_attributes(mapping.group_attributes(), mapper.required_group_attributes());
        Ok(Self {
            gateway,
            mapper,
            caches,
            resolver,
            mapping,
            user_attributes,
            group_attributes,
        })
    }

    pub fn caches(&self) -> &ServiceCaches<G, M> {
        &self.caches
    }

    pub fn resolver(&self) -> &GroupResolver<G, M> {
        &self.resolver
    }

    async fn search_first(
        &self,
        filter: &SearchFilter,
        attributes: &[AttributeName],
    ) -> Result<Option<G::Entry>> {
        let entries = self
            .gateway
            .search(filter, attributes, &SearchOptions::default())
            .await?;
        if entries.len() > 1 {
            warn!(
                %filter,
                count = entries.len(),
                "Filter matched more than one entry, using the first"
            );
        }
        Ok(entries.into_iter().next())
    }

    async fn bulk_search(
        &self,
        query: SearchFilter,
        attributes: &[AttributeName],
        options: &SearchOptions,
    ) -> Result<Arc<Vec<G::Entry>>> {
        options.check_cancelled()?;
        let key = BulkQueryKey::new(&query, attributes).with_size_limit(options.size_limit);
        let gateway = &self.gateway;
        self.caches
            .bulk
            .get_or_add(key, |_| async move {
                gateway.search(&query, attributes, options).await
            })
            .await
    }

    fn remember(&self, entry: &G::Entry) {
        if let Err(error) = self.caches.entries.add(entry) {
            debug!(%error, dn = entry.distinguished_name(), "Entry not cached");
        }
    }

    async fn finish_user(&self, entry: &G::Entry) -> Result<M::User> {
        self.remember(entry);
        let mut user = self.mapper.map_user(entry);
        let groups = self.resolver.resolve_groups(entry).await?;
        self.mapper.set_user_groups(&mut user, groups);
        Ok(user)
    }

    async fn finish_group(&self, entry: &G::Entry) -> Result<M::Group> {
        self.remember(entry);
        let mut group = self.mapper.map_group(entry);
        if self.mapper.group_is_group_member() {
            let parents = self.resolver.resolve_parent_groups(entry).await?;
            self.mapper.set_group_parents(&mut group, parents);
        }
        Ok(group)
    }

    async fn find_user(
        &self,
        attribute: &AttributeName,
        value: &str,
        argument: &str,
    ) -> Result<Option<M::User>> {
        check_argument(value, argument)?;
        let filter = SearchFilter::equality(attribute.clone(), value);
        let key = filter.to_string();
        self.caches
            .users
            .get_or_add(&key, |_| async move {
                let query = filter.merged_with_base(&self.mapping.user_filter);
                match self.search_first(&query, &self.user_attributes).await? {
                    Some(entry) => self.finish_user(&entry).await.map(Some),
                    None => Ok(None),
                }
            })
            .await
    }

    async fn find_group(
        &self,
        attribute: &AttributeName,
        value: &str,
        argument: &str,
    ) -> Result<Option<M::Group>> {
        check_argument(value, argument)?;
        let filter = SearchFilter::equality(attribute.clone(), value);
        let key = filter.to_string();
        self.caches
            .groups
            .get_or_add(&key, |_| async move {
                let query = filter.merged_with_base(&self.mapping.group_filter);
                match self.search_first(&query, &self.group_attributes).await? {
                    Some(entry) => self.finish_group(&entry).await.map(Some),
                    None => Ok(None),
                }
            })
            .await
    }

    async fn list_users(
        &self,
        filter: Option<SearchFilter>,
        options: &SearchOptions,
    ) -> Result<Vec<M::User>> {
        let query = listing_filter(filter, &self.mapping.user_filter);
        let entries = self
            .bulk_search(query, &self.user_attributes, options)
            .await?;
        let mut users = Vec::with_capacity(entries.len());
        for entry in entries.iter() {
            options.check_cancelled()?;
            let user = self.finish_user(entry).await?;
            cache_object(&self.caches.users, &user);
            users.push(user);
        }
        debug!(count = users.len(), "Listed users");
        Ok(users)
    }

    async fn list_groups(
        &self,
        filter: Option<SearchFilter>,
        options: &SearchOptions,
    ) -> Result<Vec<M::Group>> {
        let query = listing_filter(filter, &self.mapping.group_filter);
        let entries = self
            .bulk_search(query, &self.group_attributes, options)
            .await?;
        let mut groups = Vec::with_capacity(entries.len());
        for entry in entries.iter() {
            options.check_cancelled()?;
            let group = self.finish_group(entry).await?;
            cache_object(&self.caches.groups, &group);
            groups.push(group);
        }
        debug!(count = groups.len(), "Listed groups");
        Ok(groups)
    }
}

#[async_trait]
impl<G, M> UserSearchHandler for SearchService<G, M>
where
    G: DirectoryGateway,
    M: EntryMapper<G::Entry>,
{
    type User = M::User;

    #[instrument(skip(self), level = "debug")]
    async fn get_user_by_identity(&self, identity: &str) -> Result<Option<M::User>> {
        self.find_user(&self.mapping.identity, identity, "identity")
            .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_user_by_account_name(&self, account_name: &str) -> Result<Option<M::User>> {
        self.find_user(&self.mapping.account_name, account_name, "account name")
            .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_user_by_distinguished_name(&self, dn: &str) -> Result<Option<M::User>> {
        self.find_user(&self.mapping.distinguished_name, dn, "distinguished name")
            .await
    }

    #[instrument(skip(self, options), level = "debug")]
    async fn get_users(
        &self,
        filter: Option<SearchFilter>,
        options: &SearchOptions,
    ) -> Result<Vec<M::User>> {
        self.list_users(filter, options).await
    }
}

#[async_trait]
impl<G, M> GroupSearchHandler for SearchService<G, M>
where
    G: DirectoryGateway,
    M: EntryMapper<G::Entry>,
{
    type Group = M::Group;

    #[instrument(skip(self), level = "debug")]
    async fn get_group_by_identity(&self, identity: &str) -> Result<Option<M::Group>> {
        self.find_group(&self.mapping.identity, identity, "identity")
            .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_group_by_account_name(&self, account_name: &str) -> Result<Option<M::Group>> {
        self.find_group(&self.mapping.account_name, account_name, "account name")
            .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_group_by_distinguished_name(&self, dn: &str) -> Result<Option<M::Group>> {
        self.find_group(&self.mapping.distinguished_name, dn, "distinguished name")
            .await
    }

    #[instrument(skip(self, options), level = "debug")]
    async fn get_groups(
        &self,
        filter: Option<SearchFilter>,
        options: &SearchOptions,
    ) -> Result<Vec<M::Group>> {
        self.list_groups(filter, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AttributeMapper;
    use dirsearch_domain::{
        options::{CachingMode, CachingOptions, LdapOptionsBuilder},
        schema::DirectorySchema,
        types::{DirectoryEntry, Dn, Group, User},
    };
    use dirsearch_domain_handlers::CancellationToken;
    use dirsearch_test_utils::{
        fixtures::{ad_group, ad_user, group_dn, sid, user_dn},
        InMemoryDirectory, MockTestGateway,
    };
    use pretty_assertions::assert_eq;

    type Service<G> = SearchService<G, AttributeMapper>;

    fn options(mode: CachingMode) -> LdapOptions {
        LdapOptionsBuilder::default()
            .is_recursive_group_membership(true)
            .caching(CachingOptions {
                mode,
                duration_seconds: 60,
            })
            .build()
            .unwrap()
    }

    fn make_service<G: DirectoryGateway<Entry = DirectoryEntry>>(
        gateway: Arc<G>,
        options: &LdapOptions,
        hierarchical: bool,
    ) -> Service<G> {
        let mapping = Arc::new(options.attribute_mapping());
        let mapper = if hierarchical {
            AttributeMapper::new(mapping)
        } else {
            AttributeMapper::flat(mapping)
        };
        SearchService::new(gateway, Arc::new(mapper), options).unwrap()
    }

    fn directory() -> Arc<InMemoryDirectory> {
        Arc::new(InMemoryDirectory::new([
            ad_group("Domain Users", 513, &[]),
            ad_group("Engineering", 1101, &["Staff"]),
            ad_group("Staff", 1102, &[]),
            ad_user("Alice", 1001, Some(513), &["Engineering"]),
            ad_user("Bob", 1002, Some(513), &[]),
        ]))
    }

    fn group_names(groups: &[Group]) -> Vec<&str> {
        groups
            .iter()
            .map(|g| g.account_name.as_deref().unwrap_or_default())
            .collect()
    }

    #[tokio::test]
    async fn test_get_user_resolves_groups() {
        let directory = directory();
        let service = make_service(directory.clone(), &options(CachingMode::FixedExpiration), false);

        let alice: User = service
            .get_user_by_account_name("alice")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(alice.dn, Dn::from(user_dn("Alice").as_str()));
        assert_eq!(alice.identity, Some(sid(1001)));
        assert_eq!(
            group_names(&alice.groups),
            vec!["Domain Users", "Engineering", "Staff"]
        );
        assert!(alice.groups[0].is_primary);
        assert_eq!(
            directory.queries()[0],
            "(&(&(objectCategory=person)(objectClass=user))(sAMAccountName=alice))"
        );
    }

    #[tokio::test]
    async fn test_single_lookups_are_cached_under_every_key() {
        let directory = directory();
        let service = make_service(directory.clone(), &options(CachingMode::SlidingExpiration), false);
        let alice = service.get_user_by_account_name("alice").await.unwrap();
        let queries = directory.query_count();

        assert_eq!(
            service.get_user_by_identity(&sid(1001)).await.unwrap(),
            alice
        );
        assert_eq!(
            service
                .get_user_by_distinguished_name(&user_dn("Alice"))
                .await
                .unwrap(),
            alice
        );
        assert_eq!(directory.query_count(), queries);
        assert_eq!(service.caches().users.stats().hits(), 2);
    }

    #[tokio::test]
    async fn test_disabled_cache_always_queries() {
        let directory = directory();
        let service = make_service(directory.clone(), &options(CachingMode::None), false);
        service.get_user_by_account_name("bob").await.unwrap();
        let queries = directory.query_count();
        service.get_user_by_account_name("bob").await.unwrap();
        assert_eq!(directory.query_count(), 2 * queries);
    }

    #[tokio::test]
    async fn test_empty_arguments_are_rejected_before_io() {
        let directory = directory();
        let service = make_service(directory.clone(), &options(CachingMode::FixedExpiration), false);
        assert!(matches!(
            service.get_user_by_identity("").await,
            Err(DirectoryError::InvalidArgument(_))
        ));
        assert!(matches!(
            service.get_group_by_distinguished_name("  ").await,
            Err(DirectoryError::InvalidArgument(_))
        ));
        assert_eq!(directory.query_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_user_is_none() {
        let service = make_service(directory(), &options(CachingMode::FixedExpiration), false);
        assert_eq!(service.get_user_by_account_name("mallory").await, Ok(None));
    }

    #[tokio::test]
    async fn test_multiple_matches_return_the_first() {
        let directory = Arc::new(InMemoryDirectory::new([
            ad_user("Bob", 1002, None, &[]),
            ad_user("Bob2", 1003, None, &[]).with_attribute("sAMAccountName", ["bob"]),
        ]));
        let service = make_service(directory, &options(CachingMode::FixedExpiration), false);
        let bob = service.get_user_by_account_name("bob").await.unwrap().unwrap();
        assert_eq!(bob.dn, Dn::from(user_dn("Bob").as_str()));
    }

    #[tokio::test]
    async fn test_get_group_with_parents() {
        let directory = directory();
        let service = make_service(directory, &options(CachingMode::FixedExpiration), true);
        let engineering = service
            .get_group_by_distinguished_name(&group_dn("Engineering"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(engineering.account_name.as_deref(), Some("Engineering"));
        assert!(!engineering.is_primary);
        assert_eq!(group_names(&engineering.parent_groups), vec!["Staff"]);
    }

    fn posix_entry(dn: &str, class: &str, name: &str, gid: &str, member_of: &[&str]) -> DirectoryEntry {
        DirectoryEntry::new(dn)
            .with_attribute("objectClass", [class])
            .with_attribute("entryUUID", [format!("uuid-{name}")])
            .with_attribute(if class == "posixGroup" { "cn" } else { "uid" }, [name])
            .with_attribute("gidNumber", [gid])
            .with_attribute("memberOf", member_of.iter().copied())
    }

    #[tokio::test]
    async fn test_posix_group_is_not_its_own_primary_parent() {
        const DEVS: &str = "cn=devs,ou=groups,dc=example,dc=com";
        const STAFF: &str = "cn=staff,ou=groups,dc=example,dc=com";
        let directory = Arc::new(InMemoryDirectory::new([
            posix_entry(DEVS, "posixGroup", "devs", "100", &[STAFF]),
            posix_entry(STAFF, "posixGroup", "staff", "200", &[]),
            posix_entry(
                "uid=alice,ou=people,dc=example,dc=com",
                "posixAccount",
                "alice",
                "100",
                &[],
            ),
        ]));
        for recursive in [false, true] {
            let options = LdapOptionsBuilder::default()
                .schema(DirectorySchema::Rfc2307)
                .is_recursive_group_membership(recursive)
                .build()
                .unwrap();
            let service = make_service(directory.clone(), &options, true);

            let devs = service
                .get_group_by_distinguished_name(DEVS)
                .await
                .unwrap()
                .unwrap();
            let parents: Vec<(&str, bool)> = devs
                .parent_groups
                .iter()
                .map(|g| (g.dn.as_str(), g.is_primary))
                .collect();
            assert_eq!(parents, vec![(STAFF, false)]);

            // Users still get their primary group through gidNumber.
            let alice = service.get_user_by_account_name("alice").await.unwrap().unwrap();
            assert_eq!(alice.groups[0].dn, Dn::from(DEVS));
            assert!(alice.groups[0].is_primary);
        }
    }

    #[tokio::test]
    async fn test_get_users_merges_base_filter() {
        let directory = directory();
        let service = make_service(directory.clone(), &options(CachingMode::FixedExpiration), false);
        let users = service
            .get_users(
                Some(SearchFilter::equality("sAMAccountName", "bob")),
                &SearchOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(group_names(&users[0].groups), vec!["Domain Users"]);
        assert_eq!(
            directory.queries()[0],
            "(&(&(objectCategory=person)(objectClass=user))(sAMAccountName=bob))"
        );
        let all = service
            .get_users(None, &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        // Listed users can be looked up without another query.
        let queries = directory.query_count();
        service.get_user_by_account_name("alice").await.unwrap();
        assert_eq!(directory.query_count(), queries);
    }

    #[tokio::test]
    async fn test_bulk_results_are_cached() {
        let directory = directory();
        let service = make_service(directory.clone(), &options(CachingMode::FixedExpiration), false);
        for _ in 0..2 {
            let groups = service
                .get_groups(None, &SearchOptions::default())
                .await
                .unwrap();
            assert_eq!(
                group_names(&groups),
                vec!["Domain Users", "Engineering", "Staff"]
            );
        }
        assert_eq!(directory.query_count(), 1);
        assert_eq!(service.caches().bulk.stats().hits(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_listing_issues_no_query() {
        let directory = directory();
        let service = make_service(directory.clone(), &options(CachingMode::FixedExpiration), false);
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(
            service
                .get_users(None, &SearchOptions::with_cancellation(token))
                .await,
            Err(DirectoryError::Cancelled)
        );
        assert_eq!(directory.query_count(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_stops_per_entry_resolution() {
        let token = CancellationToken::new();
        let mut gateway = MockTestGateway::new();
        let cancel = token.clone();
        // The listing completes, but the token fires before any membership
        // is resolved; no further query may happen.
        gateway.expect_search().times(1).returning(move |_, _, _| {
            cancel.cancel();
            Ok(vec![
                ad_user("Alice", 1001, Some(513), &["Engineering"]),
                ad_user("Bob", 1002, Some(513), &[]),
            ])
        });
        let service = make_service(Arc::new(gateway), &options(CachingMode::FixedExpiration), false);
        assert_eq!(
            service
                .get_users(None, &SearchOptions::with_cancellation(token))
                .await,
            Err(DirectoryError::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_gateway_errors_are_propagated_and_not_cached() {
        let mut gateway = MockTestGateway::new();
        gateway
            .expect_search()
            .times(2)
            .returning(|_, _, _| Err(DirectoryError::Gateway("timeout".to_owned())));
        let service = make_service(Arc::new(gateway), &options(CachingMode::FixedExpiration), false);
        for _ in 0..2 {
            assert_eq!(
                service.get_group_by_account_name("admins").await,
                Err(DirectoryError::Gateway("timeout".to_owned()))
            );
        }
    }
}
