use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{Metadata, Object};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ConfigMap {
    pub metadata: Metadata,
    #[serde(default)]
    pub data: HashMap<String, String>,
}

impl Object for ConfigMap {
    fn kind(&self) -> &'static str {
        "configmap"
    }

    fn name(&self) -> &String {
        &self.metadata.name
    }

    fn meta(&self) -> &Metadata {
        &self.metadata
    }
}
