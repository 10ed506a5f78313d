//! Deep merge of caller supplied JSON into a serialized document.

use serde_json::Value;

/// Merge `overlay` into `base`.
///
/// Objects are merged key by key, recursively. Any other overlay value
/// (including arrays and `null`) replaces the base value outright.
pub fn merge_json(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(base_value) => merge_json(base_value, overlay_value),
                    None => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}
