//! Property-bag reader for query results
//!
//! Depending on the result serialization, a node or relationship can arrive
//! as several shapes. [`props_dict`] flattens them all into one property map,
//! with a documented fallback order:
//!
//! 1. a plain object that is not a wrapper → used as-is
//! 2. an object wrapping its payload in a `properties` object (the `graph`
//!    result format) → the inner object
//! 3. an array of `[key, value]` pairs → collected
//! 4. anything else → empty

use serde_json::{Map, Value};

/// Flattens a query-result value into a property map.
pub fn props_dict(value: &Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => {
            if let Some(Value::Object(inner)) = map.get("properties") {
                // Wrapper shapes carry metadata next to `properties`.
                if map.contains_key("labels") || map.contains_key("id") || map.contains_key("type")
                {
                    return inner.clone();
                }
            }
            map.clone()
        }
        Value::Array(items) => {
            let mut out = Map::new();
            for item in items {
                if let Value::Array(pair) = item {
                    if let [Value::String(key), value] = pair.as_slice() {
                        out.insert(key.clone(), value.clone());
                    }
                }
            }
            out
        }
        _ => Map::new(),
    }
}

/// String property, treating absent and non-string values as empty.
pub fn prop_str(props: &Map<String, Value>, key: &str) -> String {
    props
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// String-list property, skipping non-string elements.
pub fn prop_str_list(props: &Map<String, Value>, key: &str) -> Vec<String> {
    props
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Embedding vector property, absent unless every element is numeric.
pub fn prop_embedding(props: &Map<String, Value>, key: &str) -> Option<Vec<f32>> {
    let items = props.get(key)?.as_array()?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        out.push(item.as_f64()? as f32);
    }
    Some(out)
}
