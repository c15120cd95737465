//! Blinded-attribute query compilation.
//!
//! A structured query names a blinded index (by HMAC key id) and asks
//! either for equality on full (name, value) pairs (`equals`) or for the
//! presence of names (`has`). Compilation turns it into a selector over
//! the derived attribute arrays plus the index expected to serve it.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::docs::{encode_component, ATTRIBUTES_INDEX, ATTRIBUTE_NAMES_INDEX, INDEX_DDOC};
use crate::engine::IndexHint;
use crate::error::{StoreError, StoreResult};
use crate::ids::LocalId;

/// Largest limit a caller may pass to a paged find.
pub const MAX_FIND_LIMIT: usize = 1000;

/// Largest limit accepted at compilation: one more than the page ceiling,
/// so a pager can probe for a further page.
pub const MAX_QUERY_LIMIT: usize = MAX_FIND_LIMIT + 1;

/// A structured query against a vault's blinded index.
#[derive(Debug, Clone, Default)]
pub struct EdvQuery {
    /// Id of the HMAC key whose blinded attributes are queried.
    pub index: String,
    /// Equality alternatives: a document matches when all pairs of any one
    /// map match. Exclusive with `has`.
    pub equals: Option<Vec<BTreeMap<String, String>>>,
    /// Names that must all be present. Exclusive with `equals`.
    pub has: Option<Vec<String>>,
    /// Ask for a match count instead of documents.
    pub count: bool,
    /// Maximum number of matches to return.
    pub limit: Option<usize>,
}

/// A compiled query: selector, index hint, and carried-over options.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    /// Selector over the document collection.
    pub selector: Value,
    /// Index expected to serve the selector.
    pub use_index: IndexHint,
    /// Maximum number of matches to return.
    pub limit: Option<usize>,
    /// Whether the caller asked for a count.
    pub count: bool,
}

/// Compiles a structured query for one vault.
///
/// # Errors
///
/// Returns a validation error when `index` is empty, when not exactly one
/// of `equals`/`has` is given, when either list is empty, or when `limit`
/// is out of range.
pub fn compile(edv_id: &str, query: &EdvQuery) -> StoreResult<CompiledQuery> {
    LocalId::parse(edv_id)?;

    if query.index.is_empty() {
        return Err(StoreError::validation(
            "query.index",
            "must be a non-empty string",
        ));
    }
    if let Some(limit) = query.limit {
        if !(1..=MAX_QUERY_LIMIT).contains(&limit) {
            return Err(StoreError::validation(
                "query.limit",
                format!("must be an integer between 1 and {MAX_QUERY_LIMIT}"),
            ));
        }
    }

    let hmac_id = encode_component(&query.index);

    let selector = match (&query.equals, &query.has) {
        (Some(equals), None) => {
            if equals.is_empty() || equals.iter().any(BTreeMap::is_empty) {
                return Err(StoreError::validation(
                    "query.equals",
                    "must be a non-empty array of non-empty objects",
                ));
            }
            let alternatives: Vec<Value> = equals
                .iter()
                .map(|pairs| {
                    let keys: Vec<Value> = pairs
                        .iter()
                        .map(|(name, value)| {
                            Value::from(format!(
                                "{hmac_id}:{}:{}",
                                encode_component(name),
                                encode_component(value)
                            ))
                        })
                        .collect();
                    serde_json::json!({ "attributes": { "$all": keys } })
                })
                .collect();

            // The `$gt: null` clause steers the planner onto the
            // attributes index before the `$or` alternatives apply.
            serde_json::json!({
                "localEdvId": edv_id,
                "attributes": { "$gt": null },
                "$or": alternatives,
            })
        }
        (None, Some(has)) => {
            if has.is_empty() {
                return Err(StoreError::validation(
                    "query.has",
                    "must be a non-empty array of strings",
                ));
            }
            let names: Vec<Value> = has
                .iter()
                .map(|name| Value::from(format!("{hmac_id}:{}", encode_component(name))))
                .collect();
            serde_json::json!({
                "localEdvId": edv_id,
                "attributeNames": { "$all": names },
            })
        }
        _ => {
            return Err(StoreError::validation(
                "query",
                "exactly one of \"equals\" or \"has\" is required",
            ));
        }
    };

    let index_name = if query.has.is_some() {
        ATTRIBUTE_NAMES_INDEX
    } else {
        ATTRIBUTES_INDEX
    };

    Ok(CompiledQuery {
        selector,
        use_index: IndexHint::new(INDEX_DDOC, index_name),
        limit: query.limit,
        count: query.count,
    })
}
