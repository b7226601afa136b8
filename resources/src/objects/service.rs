use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{ingress::PortRef, Metadata, Object};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Service {
    pub metadata: Metadata,
    pub spec: ServiceSpec,
}

impl Object for Service {
    fn kind(&self) -> &'static str {
        "service"
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
pub struct ServiceSpec {
    /// Route service traffic to pods with label keys and values matching this
    /// selector.
    #[serde(default)]
    pub selector: HashMap<String, String>,
    /// The list of ports that are exposed by this service.
    #[serde(default)]
    pub ports: Vec<ServicePort>,
    /// clusterIP is the virtual IP assigned to the service; absent for
    /// headless and ExternalName services.
    #[serde(default)]
    pub cluster_ip: Option<String>,
    #[serde(default, rename = "type")]
    pub service_type: ServiceType,
    /// Hostname traffic is forwarded to for ExternalName services.
    #[serde(default)]
    pub external_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    #[serde(default)]
    pub name: String,
    /// The port that will be exposed by this service.
    pub port: u16,
    /// Number or name of the port to access on the pods targeted by the
    /// service.
    #[serde(default)]
    pub target_port: Option<PortRef>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum ServiceType {
    #[serde(rename = "ClusterIP")]
    ClusterIp,
    ExternalName,
}

impl Default for ServiceType {
    fn default() -> Self {
        ServiceType::ClusterIp
    }
}

impl Service {
    /// Looks up the numeric port for a port referenced by name.
    pub fn lookup_port(&self, name: &str) -> Option<u16> {
        self.spec
            .ports
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.port)
    }
}
