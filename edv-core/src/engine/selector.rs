//! Selector matching for document queries.
//!
//! Selectors are JSON objects mapping dotted field paths to conditions. A
//! condition is either a literal (deep equality) or an operator object
//! combining `$in`, `$all`, `$gt`, and `$exists`. The special top-level
//! `$or` key takes a list of alternative selectors.
//!
//! Array fields get containment semantics: `$in` matches when any element
//! of the field array equals any listed value, `$all` when the field array
//! contains every listed value.

use serde_json::Value;

/// Returns `true` when `record` satisfies `selector`.
///
/// A non-object selector matches nothing.
#[must_use]
pub fn matches(selector: &Value, record: &Value) -> bool {
    let Some(clauses) = selector.as_object() else {
        return false;
    };

    clauses.iter().all(|(key, condition)| {
        if key == "$or" {
            match condition.as_array() {
                Some(alternatives) => alternatives.iter().any(|alt| matches(alt, record)),
                None => false,
            }
        } else {
            field_matches(lookup_path(record, key), condition)
        }
    })
}

/// Resolves a dotted field path against a record.
#[must_use]
pub fn lookup_path<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = record;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn field_matches(field: Option<&Value>, condition: &Value) -> bool {
    match condition.as_object() {
        Some(ops) if is_operator_object(ops) => ops
            .iter()
            .all(|(op, argument)| operator_matches(field, op, argument)),
        _ => match field {
            Some(value) => values_equal(value, condition),
            None => false,
        },
    }
}

fn is_operator_object(ops: &serde_json::Map<String, Value>) -> bool {
    !ops.is_empty() && ops.keys().all(|key| key.starts_with('$'))
}

fn operator_matches(field: Option<&Value>, op: &str, argument: &Value) -> bool {
    match op {
        "$exists" => {
            let wanted = argument.as_bool().unwrap_or(false);
            field.is_some() == wanted
        }
        "$in" => match (field, argument.as_array()) {
            (Some(value), Some(candidates)) => candidates
                .iter()
                .any(|candidate| contains_or_equals(value, candidate)),
            _ => false,
        },
        "$all" => match (field, argument.as_array()) {
            (Some(Value::Array(elements)), Some(required)) => required
                .iter()
                .all(|needle| elements.iter().any(|element| values_equal(element, needle))),
            _ => false,
        },
        "$gt" => match field {
            Some(value) => collate(value, argument) == std::cmp::Ordering::Greater,
            None => false,
        },
        _ => false,
    }
}

/// Equality for `$in`: an array field matches when any element equals the
/// candidate; a scalar field matches on plain equality.
fn contains_or_equals(field: &Value, candidate: &Value) -> bool {
    match field {
        Value::Array(elements) => elements
            .iter()
            .any(|element| values_equal(element, candidate)),
        other => values_equal(other, candidate),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    collate(a, b) == std::cmp::Ordering::Equal
}

/// Total order over JSON values: null < booleans < numbers < strings <
/// arrays < objects, with the natural order inside each class.
fn collate(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    let rank_a = type_rank(a);
    let rank_b = type_rank(b);
    if rank_a != rank_b {
        return rank_a.cmp(&rank_b);
    }

    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (ex, ey) in x.iter().zip(y.iter()) {
                let ord = collate(ex, ey);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            // Key-wise comparison; enough to make equality exact.
            let mut keys_a: Vec<_> = x.keys().collect();
            let mut keys_b: Vec<_> = y.keys().collect();
            keys_a.sort();
            keys_b.sort();
            for (ka, kb) in keys_a.iter().zip(keys_b.iter()) {
                let ord = ka
                    .cmp(kb)
                    .then_with(|| collate(&x[ka.as_str()], &y[kb.as_str()]));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            keys_a.len().cmp(&keys_b.len())
        }
        _ => Ordering::Equal,
    }
}

const fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}
