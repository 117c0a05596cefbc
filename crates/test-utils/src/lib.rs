pub mod directory;
pub mod fixtures;

use async_trait::async_trait;
use dirsearch_domain::{
    error::Result,
    filter::SearchFilter,
    types::{AttributeName, DirectoryEntry},
};
use dirsearch_domain_handlers::handler::{DirectoryGateway, SearchOptions};

pub use directory::InMemoryDirectory;

mockall::mock! {
    pub TestGateway {}
    #[async_trait]
    impl DirectoryGateway for TestGateway {
        type Entry = DirectoryEntry;
        async fn search(
            &self,
            filter: &SearchFilter,
            attributes: &[AttributeName],
            options: &SearchOptions,
        ) -> Result<Vec<DirectoryEntry>>;
    }
}
