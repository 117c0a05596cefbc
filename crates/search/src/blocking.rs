use dirsearch_domain::{
    error::{DirectoryError, Result},
    filter::SearchFilter,
};
use dirsearch_domain_handlers::handler::{SearchHandler, SearchOptions};
use tokio::runtime::{Builder, Runtime};

/// Synchronous front of a [`SearchHandler`].
///
/// Each call drives the asynchronous handler to completion on a runtime owned
/// by this value, so it must not be used from within another runtime.
pub struct BlockingSearchService<S> {
    inner: S,
    runtime: Runtime,
}

impl<S: SearchHandler> BlockingSearchService<S> {
    pub fn new(inner: S) -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| DirectoryError::Configuration(format!("Could not start runtime: {e}")))?;
        Ok(Self { inner, runtime })
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn get_user_by_identity(&self, identity: &str) -> Result<Option<S::User>> {
        self.runtime
            .block_on(self.inner.get_user_by_identity(identity))
    }

    pub fn get_user_by_account_name(&self, account_name: &str) -> Result<Option<S::User>> {
        self.runtime
            .block_on(self.inner.get_user_by_account_name(account_name))
    }

    pub fn get_user_by_distinguished_name(&self, dn: &str) -> Result<Option<S::User>> {
        self.runtime
            .block_on(self.inner.get_user_by_distinguished_name(dn))
    }

    pub fn get_users(
        &self,
        filter: Option<SearchFilter>,
        options: &SearchOptions,
    ) -> Result<Vec<S::User>> {
        self.runtime.block_on(self.inner.get_users(filter, options))
    }

    pub fn get_group_by_identity(&self, identity: &str) -> Result<Option<S::Group>> {
        self.runtime
            .block_on(self.inner.get_group_by_identity(identity))
    }

    pub fn get_group_by_account_name(&self, account_name: &str) -> Result<Option<S::Group>> {
        self.runtime
            .block_on(self.inner.get_group_by_account_name(account_name))
    }

    pub fn get_group_by_distinguished_name(&self, dn: &str) -> Result<Option<S::Group>> {
        self.runtime
            .block_on(self.inner.get_group_by_distinguished_name(dn))
    }

    pub fn get_groups(
        &self,
        filter: Option<SearchFilter>,
        options: &SearchOptions,
    ) -> Result<Vec<S::Group>> {
        self.runtime.block_on(self.inner.get_groups(filter, options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AttributeMapper, SearchService};
    use dirsearch_domain::options::LdapOptions;
    use dirsearch_test_utils::{
        fixtures::{ad_group, ad_user},
        InMemoryDirectory,
    };
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[test]
    fn test_blocking_lookups() {
        let directory = Arc::new(InMemoryDirectory::new([
            ad_group("Domain Users", 513, &[]),
            ad_group("Engineering", 1101, &[]),
            ad_user("Alice", 1001, Some(513), &["Engineering"]),
        ]));
        let options = LdapOptions::default();
        let mapper = Arc::new(AttributeMapper::flat(Arc::new(options.attribute_mapping())));
        let service = BlockingSearchService::new(
            SearchService::new(directory.clone(), mapper, &options).unwrap(),
        )
        .unwrap();

        let alice = service.get_user_by_account_name("alice").unwrap().unwrap();
        assert_eq!(alice.groups.len(), 2);
        let groups = service.get_groups(None, &SearchOptions::default()).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(service.get_group_by_account_name("nobody").unwrap(), None);

        // Same cache discipline as the asynchronous service.
        let queries = directory.query_count();
        service.get_user_by_account_name("alice").unwrap();
        assert_eq!(directory.query_count(), queries);
    }
}
