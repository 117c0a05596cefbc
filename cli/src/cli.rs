use clap::{Args, Parser, Subcommand};

/// dirsearch looks up users and groups in an LDAP or Active Directory server,
/// resolving their group memberships.
#[derive(Debug, Parser, Clone)]
#[clap(version, author = "The dirsearch contributors")]
pub struct CLIOpts {
    #[clap(flatten)]
    pub general_config: GeneralConfigOpts,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Look up a single user and its groups.
    #[clap(name = "user")]
    User(LookupOpts),
    /// Look up a single group.
    #[clap(name = "group")]
    Group(LookupOpts),
    /// List the users matching a filter.
    #[clap(name = "users")]
    Users(ListOpts),
    /// List the groups matching a filter.
    #[clap(name = "groups")]
    Groups(ListOpts),
    /// Print the effective configuration.
    #[clap(name = "show_config")]
    ShowConfig,
}

#[derive(Debug, Args, Clone, Default)]
pub struct GeneralConfigOpts {
    /// Change config file name.
    #[clap(
        short,
        long,
        default_value = "dirsearch_config.toml",
        env = "DIRSEARCH_CONFIG_FILE",
        global = true
    )]
    pub config_file: String,

    /// Set verbose logging.
    #[clap(short, long, global = true)]
    pub verbose: bool,

    /// Server URL, e.g. "ldaps://dc1.example.com".
    #[clap(long, global = true)]
    pub url: Option<String>,

    /// DN to bind as. Anonymous if empty.
    #[clap(long, global = true)]
    pub bind_dn: Option<String>,

    /// Password of the bind DN. Prefer the DIRSEARCH_LDAP__BIND_PASSWORD
    /// environment variable.
    #[clap(long, global = true)]
    pub bind_password: Option<String>,

    /// Base DN of every search, e.g. "dc=example,dc=com".
    #[clap(long, global = true)]
    pub search_base: Option<String>,

    /// Follow nested group memberships.
    #[clap(long, global = true)]
    pub recursive: Option<bool>,

    /// Attach the parent groups of each group to the output.
    #[clap(long, global = true)]
    pub hierarchical_groups: Option<bool>,
}

#[derive(Debug, Args, Clone)]
#[group(required = true, multiple = false)]
pub struct LookupOpts {
    /// Identity, e.g. the objectSid in "S-1-5-21-..." form.
    #[clap(long)]
    pub identity: Option<String>,

    /// Account name, e.g. the sAMAccountName.
    #[clap(short, long)]
    pub account_name: Option<String>,

    /// Distinguished name.
    #[clap(short, long)]
    pub dn: Option<String>,
}

#[derive(Debug, Args, Clone, Default)]
pub struct ListOpts {
    /// LDAP filter, combined with the configured user or group filter.
    #[clap(short, long)]
    pub filter: Option<String>,

    /// Stop after this many entries.
    #[clap(short, long)]
    pub limit: Option<usize>,
}

pub fn init() -> CLIOpts {
    CLIOpts::parse()
}
