//! Active Directory shaped entries for tests.

use dirsearch_domain::types::DirectoryEntry;

pub const DOMAIN_SID: &str = "S-1-5-21-1004336348-1177238915-682003330";

pub fn group_dn(name: &str) -> String {
    format!("CN={name},OU=Groups,DC=example,DC=com")
}

pub fn user_dn(name: &str) -> String {
    format!("CN={name},OU=Users,DC=example,DC=com")
}

pub fn sid(rid: u32) -> String {
    format!("{DOMAIN_SID}-{rid}")
}

/// A group named `name` with the given RID, member of the groups named in
/// `member_of`.
pub fn ad_group(name: &str, rid: u32, member_of: &[&str]) -> DirectoryEntry {
    let dn = group_dn(name);
    DirectoryEntry::new(dn.clone())
        .with_attribute("distinguishedName", [dn])
        .with_attribute("objectClass", ["top", "group"])
        .with_attribute("objectSid", [sid(rid)])
        .with_attribute("sAMAccountName", [name])
        .with_attribute("displayName", [name])
        .with_attribute("memberOf", member_of.iter().map(|g| group_dn(g)))
}

/// A user named `name` with the given RID and optional primary group RID.
pub fn ad_user(
    name: &str,
    rid: u32,
    primary_group_rid: Option<u32>,
    member_of: &[&str],
) -> DirectoryEntry {
    let dn = user_dn(name);
    let mut entry = DirectoryEntry::new(dn.clone())
        .with_attribute("distinguishedName", [dn])
        .with_attribute("objectCategory", ["person"])
        .with_attribute("objectClass", ["top", "person", "organizationalPerson", "user"])
        .with_attribute("objectSid", [sid(rid)])
        .with_attribute("sAMAccountName", [name.to_lowercase()])
        .with_attribute("displayName", [name])
        .with_attribute("memberOf", member_of.iter().map(|g| group_dn(g)));
    if let Some(primary) = primary_group_rid {
        entry = entry.with_attribute("primaryGroupID", [primary.to_string()]);
    }
    entry
}
