use async_trait::async_trait;
use dirsearch_domain::{
    error::{DirectoryError, Result},
    filter::SearchFilter,
    types::{AttributeName, DirectoryObject, RawEntry},
};
use tokio_util::sync::CancellationToken;

/// Per-call options forwarded to the gateway.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Checked between result pages and before each per-entry resolution.
    pub cancellation: Option<CancellationToken>,
    /// Maximum number of entries the server should return, if any.
    pub size_limit: Option<usize>,
}

impl SearchOptions {
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            cancellation: Some(token),
            ..Default::default()
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(DirectoryError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Issues filtered searches against the directory.
///
/// Implementations must be safe to share between tasks. Retries, timeouts and
/// paging are their business; the caller sees a single result list.
#[async_trait]
pub trait DirectoryGateway: Send + Sync {
    type Entry: RawEntry;

    async fn search(
        &self,
        filter: &SearchFilter,
        attributes: &[AttributeName],
        options: &SearchOptions,
    ) -> Result<Vec<Self::Entry>>;

    /// First match in directory order, if any.
    async fn search_single(
        &self,
        filter: &SearchFilter,
        attributes: &[AttributeName],
    ) -> Result<Option<Self::Entry>> {
        let entries = self
            .search(filter, attributes, &SearchOptions::default())
            .await?;
        Ok(entries.into_iter().next())
    }
}

/// Turns raw entries into users and groups.
pub trait EntryMapper<E: RawEntry>: Send + Sync {
    type User: DirectoryObject;
    type Group: DirectoryObject;

    fn map_user(&self, entry: &E) -> Self::User;

    fn map_group(&self, entry: &E) -> Self::Group;

    fn map_primary_group(&self, entry: &E) -> Self::Group {
        self.map_group(entry)
    }

    fn set_user_groups(&self, user: &mut Self::User, groups: Vec<Self::Group>);

    /// Only called when [`Self::group_is_group_member`] is true.
    fn set_group_parents(&self, group: &mut Self::Group, parents: Vec<Self::Group>);

    /// Whether the group type carries its own parent groups.
    fn group_is_group_member(&self) -> bool;

    fn required_user_attributes(&self) -> Vec<AttributeName>;

    fn required_group_attributes(&self) -> Vec<AttributeName>;
}

#[async_trait]
pub trait UserSearchHandler: Send + Sync {
    type User: DirectoryObject;

    async fn get_user_by_identity(&self, identity: &str) -> Result<Option<Self::User>>;
    async fn get_user_by_account_name(&self, account_name: &str) -> Result<Option<Self::User>>;
    async fn get_user_by_distinguished_name(&self, dn: &str) -> Result<Option<Self::User>>;
    async fn get_users(
        &self,
        filter: Option<SearchFilter>,
        options: &SearchOptions,
    ) -> Result<Vec<Self::User>>;
}

#[async_trait]
pub trait GroupSearchHandler: Send + Sync {
    type Group: DirectoryObject;

    async fn get_group_by_identity(&self, identity: &str) -> Result<Option<Self::Group>>;
    async fn get_group_by_account_name(&self, account_name: &str) -> Result<Option<Self::Group>>;
    async fn get_group_by_distinguished_name(&self, dn: &str) -> Result<Option<Self::Group>>;
    async fn get_groups(
        &self,
        filter: Option<SearchFilter>,
        options: &SearchOptions,
    ) -> Result<Vec<Self::Group>>;
}

pub trait SearchHandler: UserSearchHandler + GroupSearchHandler {}

impl<T: UserSearchHandler + GroupSearchHandler> SearchHandler for T {}
