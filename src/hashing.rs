//! Content fingerprinting for change detection
//!
//! A record's `data_hash` is a SHA-256 over a canonical JSON rendering of its
//! raw fields with churn-prone fields removed. Two fetches of an unchanged
//! object always produce the same hash, so the processor can patch only
//! `last_seen_at`/`sync_id` and skip downstream work.

use crate::types::EntityType;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Fields excluded from the fingerprint for every entity type. These move on
/// every fetch without the object itself changing.
const COMMON_CHURN_FIELDS: &[&str] = &[
    "last_seen_at",
    "lastSeenAt",
    "updated_at",
    "updatedAt",
    "created_at",
    "createdAt",
    "fetched_at",
    "fetchedAt",
    "@odata.etag",
];

/// Per-type churn fields on top of the common set.
fn type_churn_fields(entity_type: EntityType) -> &'static [&'static str] {
    match entity_type {
        EntityType::Identities => &["signInActivity", "sign_in_activity", "lastPasswordChangeDateTime"],
        EntityType::Endpoints => &["lastSyncDateTime", "last_sync_at", "uptime"],
        EntityType::Licenses => &["appliesTo"],
        _ => &[],
    }
}

/// Compute the content fingerprint for one raw record.
pub fn data_hash(entity_type: EntityType, raw_data: &Value) -> String {
    let mut pruned = raw_data.clone();
    if let Value::Object(ref mut map) = pruned {
        for field in COMMON_CHURN_FIELDS {
            map.remove(*field);
        }
        for field in type_churn_fields(entity_type) {
            map.remove(*field);
        }
    }
    let canonical = canonical_json(&pruned);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Render a JSON value with object keys sorted at every level so hashing is
/// insensitive to upstream key ordering.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => {
            out.push_str(&other.to_string());
        }
    }
}
