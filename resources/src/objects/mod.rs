use std::{collections::HashMap, fmt::Debug};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod configmap;
pub mod endpoints;
pub mod ingress;
pub mod secret;
pub mod service;

pub trait Object: Debug + Clone {
    fn kind(&self) -> &'static str;

    fn name(&self) -> &String;

    fn meta(&self) -> &Metadata;
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    /// Monotone revision assigned by the api-server, compared as a string.
    #[serde(default)]
    pub resource_version: String,
    #[serde(default)]
    pub uid: Option<Uuid>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

impl Metadata {
    /// The `namespace/name` key objects are indexed by.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}
