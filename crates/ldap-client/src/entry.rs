use dirsearch_domain::types::{AttributeName, DirectoryEntry};
use ldap3::SearchEntry;
use tracing::debug;

use crate::sid;

/// Converts an `ldap3` entry, decoding the attributes listed in
/// `sid_attributes` as binary SIDs. Other binary values are dropped.
pub fn to_directory_entry(entry: SearchEntry, sid_attributes: &[AttributeName]) -> DirectoryEntry {
    let mut result = DirectoryEntry::new(entry.dn);
    // Short SIDs can happen to be valid UTF-8 and end up with the text
    // attributes.
    for (name, values) in entry.attrs {
        let name = AttributeName::from(name);
        let values: Vec<String> = if sid_attributes.contains(&name) {
            values
                .iter()
                .filter_map(|value| sid::decode(value.as_bytes()))
                .collect()
        } else {
            values
        };
        result.attributes.entry(name).or_default().extend(values);
    }
    for (name, values) in entry.bin_attrs {
        let name = AttributeName::from(name);
        if !sid_attributes.contains(&name) {
            debug!(attribute = %name, dn = %result.dn, "Dropping binary attribute");
            continue;
        }
        let decoded = values.iter().filter_map(|value| sid::decode(value));
        result.attributes.entry(name).or_default().extend(decoded);
    }
    result
}
