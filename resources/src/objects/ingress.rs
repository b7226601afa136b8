use std::fmt;

use serde::{Deserialize, Serialize};

use super::{Metadata, Object};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Ingress {
    pub metadata: Metadata,
    pub spec: IngressSpec,
}

impl Object for Ingress {
    fn kind(&self) -> &'static str {
        "ingress"
    }

    fn name(&self) -> &String {
        &self.metadata.name
    }

    fn meta(&self) -> &Metadata {
        &self.metadata
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct IngressSpec {
    /// Backend used for requests no rule matches. When set together with an
    /// empty rule list the ingress configures the catch-all server.
    #[serde(default)]
    pub backend: Option<IngressService>,
    /// A list of host rules used to configure the Ingress.
    #[serde(default)]
    pub rules: Vec<IngressRule>,
    #[serde(default)]
    pub tls: Vec<IngressTls>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct IngressRule {
    /// Host is the fully qualified domain name of a network host.
    /// An empty host matches the default (catch-all) server.
    pub host: Option<String>,
    /// A collection of paths that map requests to services.
    #[serde(default)]
    pub paths: Vec<IngressPath>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct IngressPath {
    /// Path is matched against the path of an incoming request.
    #[serde(default)]
    pub path: String,
    /// Service references a Service as a Backend.
    pub service: IngressService,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct IngressService {
    /// Name is the referenced service. The service must exist in the same
    /// namespace as the Ingress object.
    pub name: String,
    /// Port of the referenced service, by number or by port name.
    pub port: PortRef,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressTls {
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub secret_name: String,
}

/// A service port referenced either by number or by name.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum PortRef {
    Number(u16),
    Name(String),
}

impl Default for PortRef {
    fn default() -> Self {
        PortRef::Number(0)
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortRef::Number(n) => write!(f, "{}", n),
            PortRef::Name(s) => write!(f, "{}", s),
        }
    }
}

impl PortRef {
    pub fn is_named(&self) -> bool {
        matches!(self, PortRef::Name(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_ref_deserializes_both_forms() {
        let by_number: PortRef = serde_json::from_str("80").unwrap();
        assert_eq!(by_number, PortRef::Number(80));

        let by_name: PortRef = serde_json::from_str("\"http\"").unwrap();
        assert_eq!(by_name, PortRef::Name("http".to_string()));
    }

    #[test]
    fn ingress_without_rules_is_catch_all() {
        let ing: Ingress = serde_json::from_str(
            r#"{
                "metadata": {"name": "def", "namespace": "ns"},
                "spec": {"backend": {"name": "svc", "port": 80}}
            }"#,
        )
        .unwrap();
        assert!(ing.spec.rules.is_empty());
        assert_eq!(ing.spec.backend.unwrap().port, PortRef::Number(80));
    }
}
