use std::collections::HashSet;

use crate::cli::{CLIOpts, GeneralConfigOpts};
use anyhow::{bail, Context, Result};
use dirsearch_domain::options::LdapOptions;
use dirsearch_ldap_client::LdapGatewayOptions;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use secstr::SecUtf8;
use serde::{Deserialize, Serialize};

const ENV_PREFIX: &str = "DIRSEARCH_";

#[derive(Clone, Debug, Deserialize, Serialize, derive_builder::Builder)]
#[builder(pattern = "owned")]
pub struct Configuration {
    #[builder(default = "false")]
    pub verbose: bool,
    /// Whether mapped groups carry their own parent groups.
    #[builder(default = "false")]
    pub hierarchical_groups: bool,
    #[builder(default)]
    pub options: LdapOptions,
    #[builder(default)]
    pub ldap: LdapGatewayOptions,
}

impl std::default::Default for Configuration {
    fn default() -> Self {
        ConfigurationBuilder::default().build().unwrap()
    }
}

impl Configuration {
    pub fn validate(&self) -> Result<()> {
        self.options
            .validate()
            .context("while validating the `options` section")?;
        if self.ldap.url.is_empty() {
            bail!("`ldap.url` must be set");
        }
        if self.ldap.page_size <= 0 {
            bail!("`ldap.page_size` must be positive, got {}", self.ldap.page_size);
        }
        if self.ldap.bind_dn.is_empty() && !self.ldap.bind_password.unsecure().is_empty() {
            bail!("`ldap.bind_password` is set but `ldap.bind_dn` is empty");
        }
        Ok(())
    }
}

pub trait ConfigOverrider {
    fn override_config(&self, config: &mut Configuration);
}

impl ConfigOverrider for CLIOpts {
    fn override_config(&self, config: &mut Configuration) {
        self.general_config.override_config(config);
    }
}

impl ConfigOverrider for GeneralConfigOpts {
    fn override_config(&self, config: &mut Configuration) {
        if self.verbose {
            config.verbose = true;
        }
        if let Some(url) = &self.url {
            config.ldap.url.clone_from(url);
        }
        if let Some(bind_dn) = &self.bind_dn {
            config.ldap.bind_dn.clone_from(bind_dn);
        }
        if let Some(password) = &self.bind_password {
            config.ldap.bind_password = SecUtf8::from(password.clone());
        }
        if let Some(search_base) = &self.search_base {
            config.ldap.search_base.clone_from(search_base);
        }
        if let Some(recursive) = self.recursive {
            config.options.is_recursive_group_membership = recursive;
        }
        if let Some(hierarchical_groups) = self.hierarchical_groups {
            config.hierarchical_groups = hierarchical_groups;
        }
    }
}

fn extract_keys(dict: &figment::value::Dict) -> HashSet<String> {
    use figment::value::{Dict, Value};
    fn process_value(value: &Dict, keys: &mut HashSet<String>, path: &mut Vec<String>) {
        for (key, value) in value {
            match value {
                Value::Dict(_, dict) => {
                    path.push(format!("{}__", key.to_ascii_uppercase()));
                    process_value(dict, keys, path);
                    path.pop();
                }
                _ => {
                    keys.insert(format!("{}{}", path.join(""), key.to_ascii_uppercase()));
                }
            }
        }
    }
    let mut keys = HashSet::new();
    let mut path = Vec::new();
    process_value(dict, &mut keys, &mut path);
    keys
}

fn expected_keys(dict: &figment::value::Dict) -> HashSet<String> {
    let mut keys = extract_keys(dict);
    // CLI-only values.
    keys.insert("CONFIG_FILE".to_owned());
    keys
}

/// Environment keys that do not correspond to any configuration field.
///
/// Keys below a field that is a plain value by default (such as
/// `OPTIONS__SCHEMA__CUSTOM__...` under `OPTIONS__SCHEMA`) are accepted.
fn unknown_keys(expected: &HashSet<String>, found: &HashSet<String>) -> Vec<String> {
    let mut unknown: Vec<String> = found
        .iter()
        .filter(|key| {
            !expected.contains(key.as_str())
                && !expected
                    .iter()
                    .any(|prefix| key.starts_with(&format!("{prefix}__")))
        })
        .cloned()
        .collect();
    unknown.sort();
    unknown
}

fn figment(config_file: &str) -> Figment {
    Figment::from(Serialized::defaults(Configuration::default()))
        .merge(Toml::file(config_file))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

pub fn init<C>(config_file: &str, overrides: &C) -> Result<Configuration>
where
    C: ConfigOverrider,
{
    let mut config: Configuration = figment(config_file)
        .extract()
        .context(format!("while loading the configuration from `{config_file}`"))?;
    overrides.override_config(&mut config);
    {
        use figment::{Profile, Provider};
        let expected = expected_keys(
            &Figment::from(Serialized::defaults(Configuration::default()))
                .data()?[&Profile::default()],
        );
        let env_data = Env::prefixed(ENV_PREFIX).split("__").data()?;
        if let Some(found) = env_data.get(&Profile::default()) {
            for key in unknown_keys(&expected, &extract_keys(found)) {
                eprintln!("WARNING: Unknown environment variable: {ENV_PREFIX}{key}");
            }
        }
    }
    config.validate()?;
    if config.ldap.search_base.is_empty() {
        eprintln!("WARNING: `ldap.search_base` is empty, searches start at the root DSE.");
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use dirsearch_domain::{
        options::CachingMode,
        schema::{AttributeMapping, DirectorySchema},
    };
    use figment::Jail;
    use pretty_assertions::assert_eq;

    fn opts(args: &[&str]) -> CLIOpts {
        CLIOpts::parse_from(std::iter::once("dirsearch").chain(args.iter().copied()))
    }

    #[test]
    fn check_defaults() {
        Jail::expect_with(|_| {
            let config = init("dirsearch_config.toml", &opts(&["show_config"])).unwrap();
            assert!(!config.verbose);
            assert_eq!(config.ldap.url, "ldap://localhost:389");
            assert_eq!(config.options, LdapOptions::default());
            Ok(())
        });
    }

    #[test]
    fn check_file_env_and_cli_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "dirsearch_config.toml",
                r#"
                hierarchical_groups = true

                [ldap]
                url = "ldap://dc1.example.com"
                search_base = "dc=example,dc=com"
                page_size = 200

                [options]
                schema = "rfc2307"
                max_group_expansion = 50

                [options.caching]
                mode = "fixed_expiration"
                duration_seconds = 60
                "#,
            )?;
            jail.set_env("DIRSEARCH_LDAP__BIND_DN", "cn=reader,dc=example,dc=com");
            jail.set_env("DIRSEARCH_LDAP__BIND_PASSWORD", "secret");
            jail.set_env("DIRSEARCH_LDAP__PAGE_SIZE", "100");
            let config = init(
                "dirsearch_config.toml",
                &opts(&["--url", "ldaps://dc2.example.com", "--recursive", "true", "users"]),
            )
            .unwrap();
            assert!(config.hierarchical_groups);
            assert_eq!(config.ldap.url, "ldaps://dc2.example.com");
            assert_eq!(config.ldap.search_base, "dc=example,dc=com");
            assert_eq!(config.ldap.bind_dn, "cn=reader,dc=example,dc=com");
            assert_eq!(config.ldap.bind_password.unsecure(), "secret");
            assert_eq!(config.ldap.page_size, 100);
            assert_eq!(config.options.schema, DirectorySchema::Rfc2307);
            assert!(config.options.is_recursive_group_membership);
            assert_eq!(config.options.max_group_expansion, 50);
            assert_eq!(config.options.caching.mode, CachingMode::FixedExpiration);
            assert_eq!(config.options.caching.duration_seconds, 60);
            Ok(())
        });
    }

    #[test]
    fn check_custom_schema() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "custom.toml",
                r#"
                [options.schema.custom]
                distinguished_name = "dn"
                identity = "uuid"
                account_name = "uid"
                display_name = "cn"
                groups = "memberOf"
                group_reference = "dn"
                user_filter = "(objectClass=person)"
                group_filter = "(objectClass=groupOfNames)"
                "#,
            )?;
            let config = init("custom.toml", &opts(&["show_config"])).unwrap();
            let mapping = config.options.attribute_mapping();
            assert_eq!(mapping.identity.as_str(), "uuid");
            assert_eq!(mapping.primary_group, None);
            assert_ne!(mapping, AttributeMapping::active_directory());
            Ok(())
        });
    }

    #[test]
    fn check_invalid_configuration_is_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "dirsearch_config.toml",
                r#"
                [options]
                max_group_expansion = 0
                "#,
            )?;
            init("dirsearch_config.toml", &opts(&["users"])).unwrap_err();
            jail.create_file(
                "dirsearch_config.toml",
                r#"
                [ldap]
                page_size = 0
                "#,
            )?;
            let error = init("dirsearch_config.toml", &opts(&["users"]))
                .unwrap_err()
                .to_string();
            assert!(error.contains("page_size"), "{error}");
            Ok(())
        });
    }

    #[test]
    fn check_password_without_bind_dn_is_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("DIRSEARCH_LDAP__BIND_PASSWORD", "secret");
            init("dirsearch_config.toml", &opts(&["users"])).unwrap_err();
            Ok(())
        });
    }

    #[test]
    fn check_unknown_keys() {
        let expected = HashSet::from([
            "VERBOSE".to_owned(),
            "OPTIONS__SCHEMA".to_owned(),
            "LDAP__URL".to_owned(),
        ]);
        let found = HashSet::from([
            "VERBOSE".to_owned(),
            "OPTIONS__SCHEMA__CUSTOM__IDENTITY".to_owned(),
            "LDAP__URI".to_owned(),
        ]);
        assert_eq!(unknown_keys(&expected, &found), vec!["LDAP__URI".to_owned()]);
    }
}
