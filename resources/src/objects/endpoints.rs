use serde::{Deserialize, Serialize};

use super::{Metadata, Object};

/// The set of ready addresses backing a service, grouped the way the
/// api-server reports them.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Endpoints {
    pub metadata: Metadata,
    #[serde(default)]
    pub subsets: Vec<EndpointSubset>,
}

impl Object for Endpoints {
    fn kind(&self) -> &'static str {
        "endpoints"
    }

    fn name(&self) -> &String {
        &self.metadata.name
    }

    fn meta(&self) -> &Metadata {
        &self.metadata
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct EndpointSubset {
    #[serde(default)]
    pub addresses: Vec<EndpointAddress>,
    #[serde(default)]
    pub ports: Vec<EndpointPort>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EndpointAddress {
    pub ip: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EndpointPort {
    #[serde(default)]
    pub name: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "UDP")]
    Udp,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Tcp
    }
}
