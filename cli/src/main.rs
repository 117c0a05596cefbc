#![forbid(unsafe_code)]
#![forbid(non_ascii_idents)]

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use dirsearch_domain::filter::{is_well_formed, SearchFilter};
use dirsearch_domain_handlers::{
    handler::{GroupSearchHandler, SearchOptions, UserSearchHandler},
    CancellationToken,
};
use dirsearch_ldap_client::LdapGateway;
use dirsearch_search::{AttributeMapper, SearchService};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    cli::{Command, ListOpts, LookupOpts},
    configuration::Configuration,
};

mod cli;
mod configuration;
mod logging;

type Service = SearchService<LdapGateway, AttributeMapper>;

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn listing_options(opts: &ListOpts) -> Result<(Option<SearchFilter>, SearchOptions)> {
    let filter = match &opts.filter {
        Some(raw) if !is_well_formed(raw) => bail!("Malformed filter: `{raw}`"),
        Some(raw) => Some(SearchFilter::Raw(raw.clone())),
        None => None,
    };
    let token = CancellationToken::new();
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling the search");
            ctrl_c_token.cancel();
        }
    });
    let options = SearchOptions {
        size_limit: opts.limit,
        ..SearchOptions::with_cancellation(token)
    };
    Ok((filter, options))
}

async fn lookup_user(service: &Service, opts: LookupOpts) -> Result<()> {
    let user = match (opts.identity, opts.account_name, opts.dn) {
        (Some(identity), _, _) => service.get_user_by_identity(&identity).await?,
        (_, Some(account_name), _) => service.get_user_by_account_name(&account_name).await?,
        (_, _, Some(dn)) => service.get_user_by_distinguished_name(&dn).await?,
        (None, None, None) => bail!("One of --identity, --account-name or --dn is required"),
    };
    print_json(&user.ok_or_else(|| anyhow!("No such user"))?)
}

async fn lookup_group(service: &Service, opts: LookupOpts) -> Result<()> {
    let group = match (opts.identity, opts.account_name, opts.dn) {
        (Some(identity), _, _) => service.get_group_by_identity(&identity).await?,
        (_, Some(account_name), _) => service.get_group_by_account_name(&account_name).await?,
        (_, _, Some(dn)) => service.get_group_by_distinguished_name(&dn).await?,
        (None, None, None) => bail!("One of --identity, --account-name or --dn is required"),
    };
    print_json(&group.ok_or_else(|| anyhow!("No such group"))?)
}

async fn run_command(service: &Service, command: Command) -> Result<()> {
    match command {
        Command::User(opts) => lookup_user(service, opts).await,
        Command::Group(opts) => lookup_group(service, opts).await,
        Command::Users(opts) => {
            let (filter, options) = listing_options(&opts)?;
            print_json(&service.get_users(filter, &options).await?)
        }
        Command::Groups(opts) => {
            let (filter, options) = listing_options(&opts)?;
            print_json(&service.get_groups(filter, &options).await?)
        }
        Command::ShowConfig => bail!("`show_config` does not query the directory"),
    }
}

async fn run_search_command(config: Configuration, command: Command) -> Result<()> {
    let gateway = Arc::new(
        LdapGateway::connect(config.ldap.clone())
            .await
            .context("while connecting to the directory")?,
    );
    let mapping = Arc::new(config.options.attribute_mapping());
    let mapper = if config.hierarchical_groups {
        AttributeMapper::new(mapping)
    } else {
        AttributeMapper::flat(mapping)
    };
    let service = SearchService::new(gateway.clone(), Arc::new(mapper), &config.options)?;

    let result = run_command(&service, command).await;
    let caches = service.caches();
    debug!(
        entry_hits = caches.entries.stats().hits(),
        entry_misses = caches.entries.stats().misses(),
        bulk_hits = caches.bulk.stats().hits(),
        bulk_misses = caches.bulk.stats().misses(),
        "Cache statistics"
    );

    drop(service);
    match Arc::try_unwrap(gateway) {
        Ok(gateway) => {
            if let Err(e) = gateway.unbind().await {
                warn!("Error closing the directory connection: {}", e);
            }
        }
        Err(_) => debug!("Connection still shared, not unbinding"),
    }
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_opts = cli::init();
    let config = configuration::init(&cli_opts.general_config.config_file, &cli_opts)?;
    logging::init(&config)?;
    debug!("CLI: {:#?}", &cli_opts);

    match cli_opts.command {
        Command::ShowConfig => {
            println!("Configuration: {:#?}", &config);
            Ok(())
        }
        command => {
            info!(url = %config.ldap.url, "Starting search");
            run_search_command(config, command).await
        }
    }
}
