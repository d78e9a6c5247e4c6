//! Canonical serialization for chain hashing.
//!
//! The hash input must be byte-identical across writers and verifiers:
//! fixed field order, little-endian integers, length-prefixed UTF-8
//! strings, no whitespace. `current_hash` and `signature` are excluded
//! from the input by construction.

use warden_storage::records::AuditEntryRecord;

/// Serializes the hashed fields of an entry in canonical form.
pub fn canonical_bytes(entry: &AuditEntryRecord) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        8 + 8
            + entry.event_kind.len()
            + entry.actor_type.len()
            + entry.actor_id.len()
            + entry.target.len()
            + entry.outcome.len()
            + entry.metadata_json.len()
            + entry.previous_hash.len()
            + 7 * 4,
    );

    out.extend_from_slice(&entry.sequence.to_le_bytes());
    out.extend_from_slice(&entry.timestamp.to_le_bytes());
    push_str(&mut out, &entry.event_kind);
    push_str(&mut out, &entry.actor_type);
    push_str(&mut out, &entry.actor_id);
    push_str(&mut out, &entry.target);
    push_str(&mut out, &entry.outcome);
    push_str(&mut out, &entry.metadata_json);
    push_str(&mut out, &entry.previous_hash);

    out
}

fn push_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}
