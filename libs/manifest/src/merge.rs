//! JSON merge-patch helpers.
//!
//! `merge_patch` follows RFC 7386: objects merge recursively, `null`
//! removes a key, anything else replaces the target value. `owned_paths`
//! and `remove_path` support field-ownership bookkeeping on top of it.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

/// Apply `patch` onto `target` with merge-patch semantics.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                let entry = target_map.entry(key.clone()).or_insert(Value::Null);
                merge_patch(entry, value);
            }
        }
    }
}

/// Leaf paths set by `value`. Arrays and scalars are leaves.
pub fn owned_paths(value: &Value) -> BTreeSet<Vec<String>> {
    let mut paths = BTreeSet::new();
    collect(value, &mut Vec::new(), &mut paths);
    paths
}

fn collect(value: &Value, prefix: &mut Vec<String>, out: &mut BTreeSet<Vec<String>>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                prefix.push(key.clone());
                collect(child, prefix, out);
                prefix.pop();
            }
        }
        _ if !prefix.is_empty() => {
            out.insert(prefix.clone());
        }
        _ => {}
    }
}

/// Remove the field at `path`, pruning objects left empty.
pub fn remove_path(value: &mut Value, path: &[String]) {
    let Some((head, rest)) = path.split_first() else {
        return;
    };
    let Value::Object(map) = value else {
        return;
    };
    if rest.is_empty() {
        map.remove(head);
        return;
    }
    if let Some(child) = map.get_mut(head) {
        remove_path(child, rest);
        if child.as_object().is_some_and(Map::is_empty) {
            map.remove(head);
        }
    }
}
