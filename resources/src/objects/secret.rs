use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{Metadata, Object};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Secret {
    pub metadata: Metadata,
    #[serde(default)]
    pub data: HashMap<String, Vec<u8>>,
}

impl Object for Secret {
    fn kind(&self) -> &'static str {
        "secret"
    }

    fn name(&self) -> &String {
        &self.metadata.name
    }

    fn meta(&self) -> &Metadata {
        &self.metadata
    }
}
