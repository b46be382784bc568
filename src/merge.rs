use serde_json::Value;

/// Shallow field merge: keys present in `patch` overwrite `base`.
/// A non-object on either side means `patch` replaces `base` entirely.
pub fn merge_fields(base: &Value, patch: &Value) -> Value {
    match (base.as_object(), patch.as_object()) {
        (Some(base_obj), Some(patch_obj)) => {
            let mut out = base_obj.clone();
            for (k, v) in patch_obj {
                out.insert(k.clone(), v.clone());
            }
            Value::Object(out)
        }
        _ => patch.clone(),
    }
}

/// True when merging `incoming` into `current` would change nothing.
pub fn reflects(current: &Value, incoming: &Value) -> bool {
    match (current.as_object(), incoming.as_object()) {
        (Some(cur), Some(inc)) => inc.iter().all(|(k, v)| cur.get(k) == Some(v)),
        _ => current == incoming,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn patch_keys_win_and_others_survive() {
        let base = json!({"id": "t1", "title": "Pre-Scan", "status": "pending"});
        let merged = merge_fields(&base, &json!({"status": "completed"}));
        assert_eq!(merged, json!({"id": "t1", "title": "Pre-Scan", "status": "completed"}));
    }

    #[test]
    fn non_object_patch_replaces() {
        assert_eq!(merge_fields(&json!({"a": 1}), &json!(null)), json!(null));
    }

    #[test]
    fn reflects_detects_no_op_merges() {
        let current = json!({"id": "t1", "status": "completed", "title": "A"});
        assert!(reflects(&current, &json!({"id": "t1", "status": "completed"})));
        assert!(!reflects(&current, &json!({"id": "t1", "status": "pending"})));
        assert!(!reflects(&current, &json!({"id": "t1", "created_at": "2025-01-01T00:00:00Z"})));
    }
}
