pub mod blocking;
pub mod group_resolver;
pub mod mapper;
pub mod search_service;

use std::collections::HashSet;

use dirsearch_cache::SearchCaches;
use dirsearch_domain::types::AttributeName;
use dirsearch_domain_handlers::handler::{DirectoryGateway, EntryMapper};

pub use blocking::BlockingSearchService;
pub use group_resolver::{primary_group_identity, GroupResolver, ResolvedGroup, Subject};
pub use mapper::AttributeMapper;
pub use search_service::SearchService;

/// The caches shared by a resolver and a service over gateway `G` and
/// mapper `M`.
pub type ServiceCaches<G, M> = SearchCaches<
    <G as DirectoryGateway>::Entry,
    <M as EntryMapper<<G as DirectoryGateway>::Entry>>::User,
    <M as EntryMapper<<G as DirectoryGateway>::Entry>>::Group,
>;

fn merge_attributes(
    base: Vec<AttributeName>,
    extra: impl IntoIterator<Item = AttributeName>,
) -> Vec<AttributeName> {
    let mut seen = HashSet::new();
    base.into_iter()
        .chain(extra)
        .filter(|attribute| seen.insert(attribute.clone()))
        .collect()
}
