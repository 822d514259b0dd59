//! Indexed-projection extraction and base64-property externalization,
//! per `spec.md` §4.4 ("Metadata projection & externalization").

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;

use crate::config::CollectionMap;
use crate::error::{Result, ValidationError};

/// A base64 property pulled out of the payload, decoded and ready for the
/// caller to write to the content bucket.
#[derive(Clone, Debug)]
pub struct ExternalizedProp {
    pub prop: String,
    pub bytes: Vec<u8>,
    pub content_type: String,
    /// Whether this should be stored as `text.txt` rather than `blob.bin`
    /// (`spec.md` §6 blob key schema).
    pub is_text: bool,
}

/// Result of mapping one payload against a [`CollectionMap`].
#[derive(Clone, Debug)]
pub struct MappedPayload {
    /// The indexed projection to store on `Head`/`Version.metaIndexed`.
    pub meta_indexed: Value,
    /// Payload with each base64 property replaced by `null` (the pipeline
    /// substitutes the real blob reference once the externalized bytes are
    /// written).
    pub sanitized_payload: Value,
    pub externalized: Vec<ExternalizedProp>,
}

/// Extracts the indexed projection from `payload` per `indexed_props`:
/// - empty list: every top-level property except `_system`.
/// - `"a.b.c"`: the dotted path, if present.
/// - `"a[]"`: the whole array at `a`, if present.
/// Missing paths are simply omitted (no error).
pub fn extract_indexed(map: &CollectionMap, payload: &Value) -> Value {
    let Some(payload_obj) = payload.as_object() else {
        return Value::Object(Default::default());
    };

    if map.indexed_props.is_empty() {
        let mut out = serde_json::Map::new();
        for (key, value) in payload_obj {
            if key != "_system" {
                out.insert(key.clone(), value.clone());
            }
        }
        return Value::Object(out);
    }

    let mut out = serde_json::Map::new();
    for spec in &map.indexed_props {
        if let Some(array_path) = spec.strip_suffix("[]") {
            if let Some(value) = lookup_path(payload, array_path) {
                set_path(&mut out, array_path, value.clone());
            }
        } else if let Some(value) = lookup_path(payload, spec) {
            set_path(&mut out, spec, value.clone());
        }
    }
    Value::Object(out)
}

fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn set_path(out: &mut serde_json::Map<String, Value>, path: &str, value: Value) {
    let mut segments = path.split('.');
    let Some(first) = segments.next() else { return };
    let mut remaining: Vec<&str> = segments.collect();
    if remaining.is_empty() {
        out.insert(first.to_string(), value);
        return;
    }
    let entry = out
        .entry(first.to_string())
        .or_insert_with(|| Value::Object(Default::default()));
    if !entry.is_object() {
        *entry = Value::Object(Default::default());
    }
    let nested = entry.as_object_mut().expect("just ensured object");
    let rest_path = remaining.join(".");
    set_path(nested, &rest_path, value);
}

/// Checks `validation.required_indexed` against the extracted projection.
pub fn validate_required(map: &CollectionMap, meta_indexed: &Value) -> Result<()> {
    let Some(validation) = &map.validation else {
        return Ok(());
    };
    for field in &validation.required_indexed {
        match lookup_path(meta_indexed, field) {
            Some(value) if !value.is_null() => {}
            _ => return Err(ValidationError::required_field(field.clone()).into()),
        }
    }
    Ok(())
}

/// Whether `bytes` is safe to render as `text.txt` per `spec.md` §4.4: decode
/// against `charset` and require the ratio of control characters (excluding
/// `\n`, `\r`, `\t`) to be at most 5%. Unrecognized charsets fall back to a
/// byte-wise scan rather than a char-wise one, since we don't carry a
/// multi-charset decoder.
fn is_safe_text(bytes: &[u8], charset: &str) -> bool {
    if bytes.is_empty() {
        return true;
    }
    match charset.trim().to_ascii_lowercase().as_str() {
        "utf-8" | "utf8" => {
            let Ok(s) = std::str::from_utf8(bytes) else {
                return false;
            };
            let total = s.chars().count();
            let control = s.chars().filter(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t')).count();
            control as f64 <= total as f64 * 0.05
        }
        _ => {
            let total = bytes.len();
            let control = bytes
                .iter()
                .filter(|b| (**b < 0x20 || **b == 0x7f) && !matches!(b, b'\n' | b'\r' | b'\t'))
                .count();
            control as f64 <= total as f64 * 0.05
        }
    }
}

/// Decodes each configured base64 property out of `payload`, leaving `null`
/// placeholders behind. Operates on a clone and only swaps it in once every
/// property has decoded successfully, so a mid-way decode failure leaves
/// the original payload untouched.
pub fn externalize_base64_props(map: &CollectionMap, payload: &Value) -> Result<MappedPayload> {
    let Some(base64_props) = &map.base64_props else {
        return Ok(MappedPayload {
            meta_indexed: Value::Null,
            sanitized_payload: payload.clone(),
            externalized: Vec::new(),
        });
    };

    let mut sanitized = payload.clone();
    let mut externalized = Vec::new();

    for (prop, prop_config) in base64_props {
        let Some(raw) = lookup_path(payload, prop) else {
            continue;
        };
        let Some(encoded) = raw.as_str() else {
            return Err(ValidationError::invalid_base64(
                prop.clone(),
                "property is not a string",
            )
            .into());
        };
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| ValidationError::invalid_base64(prop.clone(), e.to_string()))?;

        let wants_text = prop_config.preferred_text.unwrap_or(false) || prop_config.content_type.starts_with("text/");
        let charset = prop_config.text_charset.as_deref().unwrap_or("utf-8");
        let is_text = wants_text && is_safe_text(&bytes, charset);

        externalized.push(ExternalizedProp {
            prop: prop.clone(),
            bytes,
            content_type: prop_config.content_type.clone(),
            is_text,
        });
    }

    if let Some(sanitized_obj) = sanitized.as_object_mut() {
        for ext in &externalized {
            set_path(sanitized_obj, &ext.prop, Value::Null);
        }
    }

    Ok(MappedPayload {
        meta_indexed: Value::Null,
        sanitized_payload: sanitized,
        externalized,
    })
}

/// Full projection pass: indexed extraction, required-field validation,
/// and base64 externalization, combined so callers do it in one step.
pub fn map_payload(map: &CollectionMap, payload: &Value) -> Result<MappedPayload> {
    let meta_indexed = extract_indexed(map, payload);
    validate_required(map, &meta_indexed)?;
    let mut mapped = externalize_base64_props(map, payload)?;
    mapped.meta_indexed = meta_indexed;
    Ok(mapped)
}
