use serde_json::Value;

/// Recursively merges `src` over `dest`.
///
/// Nested maps are unioned key by key, with `src` winning on conflicts.
/// Every non-map value replaces outright: lists are replaced rather than
/// concatenated, and an explicit `null` overwrites the existing value.
pub fn deep_merge(dest: &mut Value, src: &Value) {
    match (dest, src) {
        (Value::Object(dest), Value::Object(src)) => {
            for (key, value) in src {
                match dest.get_mut(key) {
                    Some(slot) if slot.is_object() && value.is_object() => {
                        deep_merge(slot, value)
                    }
                    _ => {
                        dest.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (dest, src) => *dest = src.clone(),
    }
}
