use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// A single change streamed from the api-server watch endpoint.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", bound = "T: Serialize + DeserializeOwned")]
pub enum WatchEvent<T> {
    Put(PutEvent<T>),
    Delete(DeleteEvent),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(bound = "T: Serialize + DeserializeOwned")]
pub struct PutEvent<T> {
    pub key: String,
    pub object: T,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteEvent {
    pub key: String,
}
