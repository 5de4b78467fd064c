use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::Deployment;

/// Validated cluster settings pulled out of a deployment's free-form
/// `configuration` map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KubernetesConfig {
    pub deployment_name: Option<String>,
    pub service_name: Option<String>,
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl KubernetesConfig {
    pub fn from_configuration(config: &Map<String, Value>) -> Result<Self, String> {
        let deployment_name = optional_name(config, "deployment_name")?;
        let service_name = optional_name(config, "service_name")?;
        let namespace = optional_name(config, "namespace")?;

        let mut labels = BTreeMap::new();
        match config.get("labels") {
            None | Some(Value::Null) => {}
            Some(Value::Object(map)) => {
                for (key, value) in map {
                    let value = value
                        .as_str()
                        .ok_or_else(|| format!("label {} must be a string", key))?;
                    if !is_label_key(key) || !is_label_value(value) {
                        return Err(format!("invalid label {:?}={:?}", key, value));
                    }
                    labels.insert(key.clone(), value.to_string());
                }
            }
            Some(_) => return Err("labels must be an object of strings".to_string()),
        }

        Ok(Self {
            deployment_name,
            service_name,
            namespace,
            labels,
        })
    }

    /// Checks everything a deployment feeds into cluster names and
    /// selectors: the configuration, plus the name and version that stand
    /// in for unset resource names and labels.
    pub fn validated(
        name: &str,
        version: &str,
        configuration: &Map<String, Value>,
    ) -> Result<Self, String> {
        let config = Self::from_configuration(configuration)?;
        if !is_dns1123_label(name) {
            return Err(format!("name {:?} is not a valid resource name", name));
        }
        if config.labels.is_empty() && !is_label_value(version) {
            return Err(format!("version {:?} is not a valid label value", version));
        }
        Ok(config)
    }

    /// Resolves the cluster resources for a deployment, falling back to
    /// names derived from the deployment itself.
    pub fn resolve(&self, deployment: &Deployment, default_namespace: &str) -> ResourceRefs {
        let labels = if self.labels.is_empty() {
            BTreeMap::from([
                ("app".to_string(), deployment.name.clone()),
                ("version".to_string(), deployment.version.clone()),
            ])
        } else {
            self.labels.clone()
        };

        ResourceRefs {
            namespace: self
                .namespace
                .clone()
                .unwrap_or_else(|| default_namespace.to_string()),
            deployment_name: self
                .deployment_name
                .clone()
                .unwrap_or_else(|| deployment.name.clone()),
            service_name: self
                .service_name
                .clone()
                .unwrap_or_else(|| deployment.name.clone()),
            service_configured: self.service_name.is_some(),
            labels,
        }
    }
}

/// Cluster object names a monitor tracks for one deployment.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRefs {
    pub namespace: String,
    pub deployment_name: String,
    pub service_name: String,
    pub service_configured: bool,
    pub labels: BTreeMap<String, String>,
}

impl ResourceRefs {
    pub fn label_selector(&self) -> String {
        self.labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn optional_name(config: &Map<String, Value>, key: &str) -> Result<Option<String>, String> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(name)) if is_dns1123(name) => Ok(Some(name.clone())),
        Some(Value::String(name)) => Err(format!("{} {:?} is not a valid resource name", key, name)),
        Some(_) => Err(format!("{} must be a string", key)),
    }
}

fn is_dns1123(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 253
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        && name.starts_with(|c: char| c.is_ascii_alphanumeric())
        && name.ends_with(|c: char| c.is_ascii_alphanumeric())
}

fn is_dns1123_label(name: &str) -> bool {
    name.len() <= 63 && !name.contains('.') && is_dns1123(name)
}

/// `[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?`, at most 63 characters.
fn is_label_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && name.starts_with(|c: char| c.is_ascii_alphanumeric())
        && name.ends_with(|c: char| c.is_ascii_alphanumeric())
}

fn is_label_key(key: &str) -> bool {
    match key.split_once('/') {
        Some((prefix, name)) => is_dns1123(prefix) && is_label_name(name),
        None => is_label_name(key),
    }
}

fn is_label_value(value: &str) -> bool {
    value.is_empty() || is_label_name(value)
}

/// Container image tag syntax: `[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}`.
pub fn is_image_tag(tag: &str) -> bool {
    tag.len() <= 128
        && tag.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_')
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}
