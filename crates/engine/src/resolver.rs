//! Pluggable conflict resolution.
//!
//! A resolver merges a local and a remote document body and must be pure
//! and deterministic: identical inputs produce identical outputs on every
//! node, so gossip converges regardless of delivery order.

use meshdb_common::HlcTimestamp;
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    #[error("malformed JSON in {side} body: {source}")]
    MalformedJson {
        side: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Strategy applied when an incoming op supersedes the stored one.
pub trait ConflictResolver: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Whether the merge engine must rebuild a row by folding its full
    /// op history when ops arrive out of HLC order. Last-write-wins can
    /// gate on the latest timestamp alone (the fold would reach the same
    /// row); field-merge folds in every op, so a late-arriving older op
    /// still contributes and all replicas fold to identical state.
    fn needs_full_history(&self) -> bool {
        false
    }

    /// Merge bodies. `local` is the stored body (absent when the key is
    /// new or tombstoned); `remote` is the incoming op's body. The caller
    /// guarantees `remote_hlc > local_hlc`.
    fn merge(
        &self,
        local: Option<&str>,
        remote: &str,
        local_hlc: &HlcTimestamp,
        remote_hlc: &HlcTimestamp,
    ) -> Result<String, ResolverError>;
}

// ---------------------------------------------------------------------------
// Last-write-wins
// ---------------------------------------------------------------------------

/// Keep the body with the higher HLC. The default; together with the
/// merge engine's supersession gate this is plain overwrite semantics.
#[derive(Debug, Default, Clone, Copy)]
pub struct LastWriteWins;

impl ConflictResolver for LastWriteWins {
    fn name(&self) -> &'static str {
        "lww"
    }

    fn merge(
        &self,
        local: Option<&str>,
        remote: &str,
        local_hlc: &HlcTimestamp,
        remote_hlc: &HlcTimestamp,
    ) -> Result<String, ResolverError> {
        let winner = match local {
            Some(l) if local_hlc > remote_hlc => l,
            _ => remote,
        };
        Ok(winner.to_string())
    }
}

// ---------------------------------------------------------------------------
// Recursive field merge
// ---------------------------------------------------------------------------

/// Merge both bodies as JSON, field by field.
///
/// Object keys present on both sides recurse; keys on one side are kept,
/// which is what lets partial updates from different nodes interleave.
/// Arrays of objects with a stable `id`/`_id` merge by identity; other
/// arrays concatenate and de-duplicate. Scalars and shape mismatches go
/// to the side with the higher HLC.
///
/// Output is re-serialized through `serde_json::Value`, whose object maps
/// iterate in sorted key order, so every node emits identical bytes for
/// identical merges.
#[derive(Debug, Default, Clone, Copy)]
pub struct FieldMerge;

impl ConflictResolver for FieldMerge {
    fn name(&self) -> &'static str {
        "field-merge"
    }

    fn needs_full_history(&self) -> bool {
        true
    }

    fn merge(
        &self,
        local: Option<&str>,
        remote: &str,
        local_hlc: &HlcTimestamp,
        remote_hlc: &HlcTimestamp,
    ) -> Result<String, ResolverError> {
        let local = match local {
            Some(l) => l,
            None => return Ok(remote.to_string()),
        };

        let local_val: Value =
            serde_json::from_str(local).map_err(|source| ResolverError::MalformedJson {
                side: "local",
                source,
            })?;
        let remote_val: Value =
            serde_json::from_str(remote).map_err(|source| ResolverError::MalformedJson {
                side: "remote",
                source,
            })?;

        let merged = merge_values(&local_val, &remote_val, local_hlc, remote_hlc);
        // Value serialization cannot fail.
        Ok(merged.to_string())
    }
}

fn merge_values(
    local: &Value,
    remote: &Value,
    local_hlc: &HlcTimestamp,
    remote_hlc: &HlcTimestamp,
) -> Value {
    match (local, remote) {
        (Value::Object(l), Value::Object(r)) => {
            let mut out = Map::new();
            for (k, lv) in l {
                match r.get(k) {
                    Some(rv) => {
                        out.insert(k.clone(), merge_values(lv, rv, local_hlc, remote_hlc));
                    }
                    None => {
                        out.insert(k.clone(), lv.clone());
                    }
                }
            }
            for (k, rv) in r {
                if !l.contains_key(k) {
                    out.insert(k.clone(), rv.clone());
                }
            }
            Value::Object(out)
        }
        (Value::Array(l), Value::Array(r)) => merge_arrays(l, r, local_hlc, remote_hlc),
        // Scalars, or differing shapes: higher HLC wins.
        _ => {
            if remote_hlc > local_hlc {
                remote.clone()
            } else {
                local.clone()
            }
        }
    }
}

fn merge_arrays(
    local: &[Value],
    remote: &[Value],
    local_hlc: &HlcTimestamp,
    remote_hlc: &HlcTimestamp,
) -> Value {
    if keyed_by_id(local) && keyed_by_id(remote) {
        // Merge by identity: later-HLC side wins per element, elements on
        // only one side are kept. Output ordered by id for determinism.
        let mut by_id: std::collections::BTreeMap<String, Value> = std::collections::BTreeMap::new();
        let (older, newer) = if remote_hlc > local_hlc {
            (local, remote)
        } else {
            (remote, local)
        };
        for el in older.iter().chain(newer.iter()) {
            if let Some(id) = element_id(el) {
                by_id.insert(id, el.clone());
            }
        }
        Value::Array(by_id.into_values().collect())
    } else {
        // Concatenate and de-duplicate, local side first.
        let mut out: Vec<Value> = Vec::with_capacity(local.len() + remote.len());
        for el in local.iter().chain(remote.iter()) {
            if !out.contains(el) {
                out.push(el.clone());
            }
        }
        Value::Array(out)
    }
}

/// True when every element is an object carrying an `id` or `_id` field.
/// Vacuously true for an empty array.
fn keyed_by_id(elements: &[Value]) -> bool {
    elements.iter().all(|el| element_id(el).is_some())
}

fn element_id(el: &Value) -> Option<String> {
    let obj = el.as_object()?;
    let id = obj.get("id").or_else(|| obj.get("_id"))?;
    match id {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
