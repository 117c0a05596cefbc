//! Binary security identifiers, as stored in `objectSid`.

const HEADER_LEN: usize = 8;

/// Renders a binary SID in its `S-1-5-21-...` form.
///
/// Layout: revision (1 byte), sub-authority count (1 byte), identifier
/// authority (6 bytes, big endian), then the sub-authorities (4 bytes each,
/// little endian). Returns `None` when the length does not match the count.
pub fn decode(bytes: &[u8]) -> Option<String> {
    if bytes.len() < HEADER_LEN {
        return None;
    }
    let revision = bytes[0];
    let count = usize::from(bytes[1]);
    if bytes.len() != HEADER_LEN + 4 * count {
        return None;
    }
    let authority = bytes[2..HEADER_LEN]
        .iter()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
    let mut sid = format!("S-{revision}-{authority}");
    for chunk in bytes[HEADER_LEN..].chunks_exact(4) {
        let sub_authority = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        sid.push('-');
        sid.push_str(&sub_authority.to_string());
    }
    Some(sid)
}
