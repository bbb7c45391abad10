//! 组件元数据模块：将键值配置解码为强类型结构，并提供可自省的字段描述。
//!
//! # Component Metadata Module
//!
//! Every component is configured through a flat `name -> value` string map supplied by the
//! host. This module turns that map into typed configuration and describes the recognised
//! fields for tooling.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`Properties`] | Raw key-value configuration |
//! | [`decode_metadata`] | Case-insensitive, type-coercing decode into a schema-derived struct |
//! | [`metadata_info_from_type`] | Static [`MetadataMap`] built from a struct's JSON schema |
//! | [`parse_duration`] | Go-style duration strings (`300ms`, `1h30m`) |
//! | [`ComponentManifest`] | YAML component definition loading |
//!
//! ## Example
//!
//! ```rust
//! use component_contrib::metadata::{decode_metadata, Properties};
//! use schemars::JsonSchema;
//! use serde::Deserialize;
//!
//! #[derive(Deserialize, JsonSchema)]
//! struct Example {
//!     /// Target table.
//!     table: String,
//!     #[serde(default, rename = "numRetries")]
//!     num_retries: Option<u32>,
//! }
//!
//! let mut props = Properties::new();
//! props.insert("TABLE".into(), "events".into());
//! props.insert("numretries".into(), "3".into());
//! let decoded: Example = decode_metadata(&props)?;
//! assert_eq!(decoded.table, "events");
//! assert_eq!(decoded.num_retries, Some(3));
//! # Ok::<(), component_contrib::Error>(())
//! ```

mod component;
mod duration;

pub use component::{ComponentManifest, ComponentSpec, ManifestMetadata, MetadataItem};
pub use duration::parse_duration;

use crate::{Error, ErrorContext, Result};
use schemars::schema::{InstanceType, Schema, SchemaObject, SingleOrVec};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Raw component configuration as supplied by the host.
pub type Properties = HashMap<String, String>;

/// Descriptive listing of recognised configuration fields, keyed by field name.
pub type MetadataMap = BTreeMap<String, MetadataField>;

/// One recognised configuration field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetadataField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

struct FieldSchema {
    name: String,
    kind: Option<InstanceType>,
    description: Option<String>,
    default: Option<Value>,
}

fn fields_of<T: JsonSchema>() -> (Vec<FieldSchema>, Vec<String>) {
    let root = schemars::schema_for!(T);
    let Some(object) = root.schema.object.as_ref() else {
        return (Vec::new(), Vec::new());
    };

    let fields = object
        .properties
        .iter()
        .map(|(name, schema)| {
            let obj = match schema {
                Schema::Object(obj) => Some(obj),
                Schema::Bool(_) => None,
            };
            FieldSchema {
                name: name.clone(),
                kind: obj.and_then(primary_type),
                description: obj
                    .and_then(|o| o.metadata.as_ref())
                    .and_then(|m| m.description.clone()),
                default: obj
                    .and_then(|o| o.metadata.as_ref())
                    .and_then(|m| m.default.clone()),
            }
        })
        .collect();

    (fields, object.required.iter().cloned().collect())
}

// Option<T> is rendered as [T, null]; the non-null member decides coercion.
fn primary_type(obj: &SchemaObject) -> Option<InstanceType> {
    match obj.instance_type.as_ref()? {
        SingleOrVec::Single(t) => Some(**t),
        SingleOrVec::Vec(types) => types.iter().copied().find(|t| *t != InstanceType::Null),
    }
}

fn coerce(field: &FieldSchema, raw: &str) -> Result<Value> {
    let invalid = |expected: &str| {
        Error::configuration_with_context(
            format!("invalid value for {}", field.name),
            ErrorContext::new()
                .with_field_path(field.name.clone())
                .with_details(format!("expected {}, got '{}'", expected, raw)),
        )
    };

    match field.kind {
        Some(InstanceType::Integer) => raw
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| invalid("integer")),
        Some(InstanceType::Number) => raw
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| invalid("number")),
        Some(InstanceType::Boolean) => match raw.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" => Ok(Value::Bool(true)),
            "false" | "0" | "no" | "n" => Ok(Value::Bool(false)),
            _ => Err(invalid("boolean")),
        },
        _ => Ok(Value::String(raw.to_string())),
    }
}

/// Decode raw properties into `T`.
///
/// Keys are matched case-insensitively against the field names `T` exposes through serde
/// (including `rename`s); unknown keys are ignored. Values are coerced to the field's JSON type
/// before deserialisation, so numeric and boolean fields accept their string spellings.
pub fn decode_metadata<T>(properties: &Properties) -> Result<T>
where
    T: DeserializeOwned + JsonSchema,
{
    let (fields, _) = fields_of::<T>();
    let by_lower: HashMap<String, &FieldSchema> = fields
        .iter()
        .map(|f| (f.name.to_lowercase(), f))
        .collect();

    let mut object = serde_json::Map::new();
    for (key, raw) in properties {
        let Some(field) = by_lower.get(&key.to_lowercase()) else {
            continue;
        };
        object.insert(field.name.clone(), coerce(field, raw)?);
    }

    serde_json::from_value(Value::Object(object)).map_err(|e| {
        Error::configuration_with_context(
            "failed to decode component metadata",
            ErrorContext::new()
                .with_details(e.to_string())
                .with_source("metadata"),
        )
    })
}

/// Build a [`MetadataMap`] describing every field of `T`.
///
/// Descriptions come from the field doc comments, defaults from `#[serde(default = ...)]`.
pub fn metadata_info_from_type<T: JsonSchema>() -> MetadataMap {
    let (fields, required) = fields_of::<T>();
    fields
        .into_iter()
        .map(|f| {
            let field_type = match f.kind {
                Some(InstanceType::Integer) => "number",
                Some(InstanceType::Number) => "number",
                Some(InstanceType::Boolean) => "bool",
                _ => "string",
            };
            let default = f.default.as_ref().and_then(|v| match v {
                Value::Null => None,
                Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            });
            let entry = MetadataField {
                required: required.contains(&f.name),
                name: f.name.clone(),
                field_type: field_type.to_string(),
                description: f.description,
                default,
            };
            (f.name, entry)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn default_port() -> u16 {
        28015
    }

    #[derive(Debug, Deserialize, JsonSchema)]
    struct Sample {
        /// Host to connect to.
        address: String,
        #[serde(default, rename = "cacheTTL")]
        cache_ttl: Option<String>,
        #[serde(default = "default_port")]
        port: u16,
        #[serde(default)]
        verbose: bool,
    }

    fn props(pairs: &[(&str, &str)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_decode_is_case_insensitive() {
        let decoded: Sample = decode_metadata(&props(&[
            ("Address", "localhost"),
            ("cachettl", "10m"),
            ("VERBOSE", "yes"),
        ]))
        .unwrap();
        assert_eq!(decoded.address, "localhost");
        assert_eq!(decoded.cache_ttl.as_deref(), Some("10m"));
        assert_eq!(decoded.port, 28015);
        assert!(decoded.verbose);
    }

    #[test]
    fn test_decode_coerces_integers() {
        let decoded: Sample =
            decode_metadata(&props(&[("address", "h"), ("port", "1234")])).unwrap();
        assert_eq!(decoded.port, 1234);
    }

    #[test]
    fn test_decode_rejects_bad_integer() {
        let err = decode_metadata::<Sample>(&props(&[("address", "h"), ("port", "abc")]))
            .unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(
            err.context().and_then(|c| c.field_path.as_deref()),
            Some("port")
        );
    }

    #[test]
    fn test_decode_missing_required_field() {
        let err = decode_metadata::<Sample>(&props(&[("port", "1")])).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("address"));
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let decoded: Sample =
            decode_metadata(&props(&[("address", "h"), ("unrelated", "x")])).unwrap();
        assert_eq!(decoded.address, "h");
    }

    #[test]
    fn test_metadata_info_from_type() {
        let info = metadata_info_from_type::<Sample>();
        assert_eq!(info.len(), 4);

        let address = &info["address"];
        assert!(address.required);
        assert_eq!(address.field_type, "string");
        assert_eq!(address.description.as_deref(), Some("Host to connect to."));

        let ttl = &info["cacheTTL"];
        assert!(!ttl.required);

        let port = &info["port"];
        assert_eq!(port.field_type, "number");
        assert_eq!(port.default.as_deref(), Some("28015"));

        assert_eq!(info["verbose"].field_type, "bool");
    }
}
