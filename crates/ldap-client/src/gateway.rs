use std::time::Duration;

use async_trait::async_trait;
use dirsearch_domain::{
    error::{DirectoryError, Result},
    filter::SearchFilter,
    types::{AttributeName, DirectoryEntry},
};
use dirsearch_domain_handlers::handler::{DirectoryGateway, SearchOptions};
use ldap3::{
    controls::{Control, ControlType, PagedResults, RawControl},
    Ldap, LdapConnAsync, LdapConnSettings, LdapResult, ResultEntry, Scope, SearchEntry,
    SearchOptions as LdapSearchOptions, SearchResult,
};
use secstr::SecUtf8;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::entry::to_directory_entry;

#[derive(Clone, Debug, Deserialize, Serialize, derive_builder::Builder)]
#[builder(pattern = "owned")]
#[serde(default)]
pub struct LdapGatewayOptions {
    #[builder(default = r#"String::from("ldap://localhost:389")"#)]
    pub url: String,
    /// Empty for an anonymous connection.
    #[builder(default)]
    pub bind_dn: String,
    #[builder(default = r#"SecUtf8::from("")"#)]
    pub bind_password: SecUtf8,
    /// Base of every subtree search, e.g. `dc=example,dc=com`.
    #[builder(default)]
    pub search_base: String,
    #[builder(default = "500")]
    pub page_size: i32,
    #[builder(default = "10")]
    pub connect_timeout_seconds: u64,
    #[builder(default = "30")]
    pub operation_timeout_seconds: u64,
    #[builder(default = "false")]
    pub starttls: bool,
    /// Binary attributes holding security identifiers.
    #[builder(default = r#"vec![AttributeName::from("objectSid")]"#)]
    pub sid_attributes: Vec<AttributeName>,
}

impl std::default::Default for LdapGatewayOptions {
    fn default() -> Self {
        LdapGatewayOptionsBuilder::default().build().unwrap()
    }
}

/// A [`DirectoryGateway`] talking to a server through `ldap3`.
///
/// All searches use the Simple Paged Results control; cancellation is
/// checked before each page is requested.
pub struct LdapGateway {
    ldap: Ldap,
    options: LdapGatewayOptions,
}

impl LdapGateway {
    #[instrument(skip_all, level = "debug", fields(url = %options.url))]
    pub async fn connect(options: LdapGatewayOptions) -> Result<Self> {
        let settings = LdapConnSettings::new()
            .set_conn_timeout(Duration::from_secs(options.connect_timeout_seconds))
            .set_starttls(options.starttls);
        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &options.url)
            .await
            .map_err(|e| {
                DirectoryError::gateway(format!("Could not connect to {}: {e}", options.url))
            })?;
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(error = %e, "LDAP connection driver error");
            }
        });
        if !options.bind_dn.is_empty() {
            ldap.with_timeout(Duration::from_secs(options.operation_timeout_seconds))
                .simple_bind(&options.bind_dn, options.bind_password.unsecure())
                .await
                .and_then(LdapResult::success)
                .map_err(|e| {
                    DirectoryError::gateway(format!("Bind as {} failed: {e}", options.bind_dn))
                })?;
        }
        info!(url = %options.url, bind_dn = %options.bind_dn, "Connected to directory");
        Ok(Self { ldap, options })
    }

    pub fn options(&self) -> &LdapGatewayOptions {
        &self.options
    }

    pub async fn unbind(mut self) -> Result<()> {
        self.ldap.unbind().await.map_err(DirectoryError::gateway)
    }

    fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.options.operation_timeout_seconds)
    }
}

/// Cookie of the next page, empty once the server has sent everything.
fn next_page_cookie(result: &LdapResult) -> Vec<u8> {
    result
        .ctrls
        .iter()
        .find_map(|Control(kind, raw)| {
            matches!(kind, Some(ControlType::PagedResults))
                .then(|| raw.parse::<PagedResults>().cookie)
        })
        .unwrap_or_default()
}

const SIZE_LIMIT_EXCEEDED: u32 = 4;

/// Entries and status of one page. A size-limited search that reaches its
/// limit ends with `sizeLimitExceeded`, and the entries sent so far are kept.
fn accept_page(
    result: SearchResult,
    size_limited: bool,
) -> ldap3::result::Result<(Vec<ResultEntry>, LdapResult)> {
    if size_limited && result.1.rc == SIZE_LIMIT_EXCEEDED {
        let SearchResult(entries, status) = result;
        return Ok((entries, status));
    }
    result.success()
}

#[async_trait]
impl DirectoryGateway for LdapGateway {
    type Entry = DirectoryEntry;

    async fn search(
        &self,
        filter: &SearchFilter,
        attributes: &[AttributeName],
        options: &SearchOptions,
    ) -> Result<Vec<DirectoryEntry>> {
        let filter = filter.to_string();
        let attributes: Vec<&str> = attributes.iter().map(AttributeName::as_str).collect();
        let mut ldap = self.ldap.clone();
        let mut entries = Vec::new();
        let mut cookie = Vec::new();
        let mut pages = 0usize;
        loop {
            options.check_cancelled()?;
            if let Some(limit) = options.size_limit {
                ldap.with_search_options(
                    LdapSearchOptions::new().sizelimit(i32::try_from(limit).unwrap_or(i32::MAX)),
                );
            }
            let control = RawControl::from(PagedResults {
                size: self.options.page_size,
                cookie: std::mem::take(&mut cookie),
            });
            let (page, result) = ldap
                .with_timeout(self.operation_timeout())
                .with_controls(vec![control])
                .search(&self.options.search_base, Scope::Subtree, &filter, &attributes)
                .await
                .and_then(|result| accept_page(result, options.size_limit.is_some()))
                .map_err(DirectoryError::gateway)?;
            pages += 1;
            entries.extend(page.into_iter().map(|entry| {
                to_directory_entry(SearchEntry::construct(entry), &self.options.sid_attributes)
            }));
            if result.rc == SIZE_LIMIT_EXCEEDED {
                debug!(%filter, count = entries.len(), "Server size limit reached");
                break;
            }
            cookie = next_page_cookie(&result);
            if let Some(limit) = options.size_limit {
                if entries.len() >= limit {
                    entries.truncate(limit);
                    break;
                }
            }
            if cookie.is_empty() {
                break;
            }
        }
        debug!(%filter, pages, count = entries.len(), "Search finished");
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ldap3::asn1::{StructureTag, TagClass, PL};
    use pretty_assertions::assert_eq;

    fn result_with(ctrls: Vec<Control>) -> LdapResult {
        LdapResult {
            rc: 0,
            matched: String::new(),
            text: String::new(),
            refs: Vec::new(),
            ctrls,
        }
    }

    #[test]
    fn test_next_page_cookie() {
        let control = Control(
            Some(ControlType::PagedResults),
            RawControl::from(PagedResults {
                size: 0,
                cookie: vec![1, 2, 3],
            }),
        );
        assert_eq!(next_page_cookie(&result_with(vec![control])), vec![1, 2, 3]);
        assert!(next_page_cookie(&result_with(Vec::new())).is_empty());
    }

    fn page_with_rc(rc: u32) -> SearchResult {
        let entry = ResultEntry::new(StructureTag {
            class: TagClass::Application,
            id: 4,
            payload: PL::C(Vec::new()),
        });
        SearchResult(
            vec![entry.clone(), entry],
            LdapResult {
                rc,
                ..result_with(Vec::new())
            },
        )
    }

    #[test]
    fn test_size_limit_exceeded_keeps_the_page() {
        let (entries, status) = accept_page(page_with_rc(SIZE_LIMIT_EXCEEDED), true).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(status.rc, SIZE_LIMIT_EXCEEDED);
        let (entries, _) = accept_page(page_with_rc(0), true).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_size_limit_exceeded_without_limit_is_an_error() {
        assert!(accept_page(page_with_rc(SIZE_LIMIT_EXCEEDED), false).is_err());
        assert!(accept_page(page_with_rc(32), true).is_err());
    }

    #[test]
    fn test_default_options() {
        let options = LdapGatewayOptions::default();
        assert_eq!(options.url, "ldap://localhost:389");
        assert_eq!(options.page_size, 500);
        assert_eq!(options.sid_attributes, vec![AttributeName::from("objectSid")]);
        assert_eq!(options.bind_password.unsecure(), "");
    }

    #[tokio::test]
    async fn test_connect_to_unsupported_url_fails() {
        let options = LdapGatewayOptionsBuilder::default()
            .url("http://localhost".to_owned())
            .connect_timeout_seconds(1)
            .build()
            .unwrap();
        assert!(matches!(
            LdapGateway::connect(options).await,
            Err(DirectoryError::Gateway(_))
        ));
    }
}
