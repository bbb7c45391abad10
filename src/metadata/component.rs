//! YAML component definitions.
//!
//! ```yaml
//! apiVersion: components/v1alpha1
//! kind: Component
//! metadata:
//!   name: orders-changes
//! spec:
//!   type: bindings.rethinkdb.statechange
//!   version: v1
//!   metadata:
//!     - name: address
//!       value: "127.0.0.1:28015"
//!     - name: table
//!       value: orders
//! ```

use super::Properties;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentManifest {
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    pub metadata: ManifestMetadata,
    pub spec: ComponentSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentSpec {
    /// Component type, e.g. `bindings.rethinkdb.statechange` or `conversation.mistral`.
    #[serde(rename = "type")]
    pub component_type: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub metadata: Vec<MetadataItem>,
}

fn default_version() -> String {
    "v1".to_string()
}

/// A single `name`/`value` pair. Scalar YAML values are accepted and stringified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataItem {
    pub name: String,
    #[serde(default)]
    pub value: serde_yaml::Value,
}

impl MetadataItem {
    fn value_string(&self) -> Result<String> {
        match &self.value {
            serde_yaml::Value::Null => Ok(String::new()),
            serde_yaml::Value::String(s) => Ok(s.clone()),
            serde_yaml::Value::Bool(b) => Ok(b.to_string()),
            serde_yaml::Value::Number(n) => Ok(n.to_string()),
            _ => Err(Error::configuration_with_context(
                "metadata values must be scalars",
                ErrorContext::new()
                    .with_field_path(format!("spec.metadata.{}", self.name))
                    .with_source("manifest"),
            )),
        }
    }
}

impl ComponentManifest {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let manifest: ComponentManifest = serde_yaml::from_str(content)?;
        if let Some(kind) = manifest.kind.as_deref() {
            if kind != "Component" {
                return Err(Error::configuration_with_context(
                    format!("unsupported manifest kind '{}'", kind),
                    ErrorContext::new()
                        .with_field_path("kind")
                        .with_source("manifest"),
                ));
            }
        }
        Ok(manifest)
    }

    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_yaml_str(&content)
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn component_type(&self) -> &str {
        &self.spec.component_type
    }

    /// Flatten `spec.metadata` into [`Properties`]. Later entries win on duplicate names.
    pub fn properties(&self) -> Result<Properties> {
        let mut props = Properties::with_capacity(self.spec.metadata.len());
        for item in &self.spec.metadata {
            props.insert(item.name.clone(), item.value_string()?);
        }
        Ok(props)
    }
}
