use std::collections::HashMap;

use anyhow::{anyhow, Result};
use futures_util::stream::StreamExt;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use super::{ListerWatcher, Store};
use crate::models::etcd::WatchEvent;

pub(super) struct Reflector<T> {
    pub(super) lw: ListerWatcher<T>,
    pub(super) store: Store<T>,
}

#[derive(Debug)]
pub(super) enum ReflectorNotification<T> {
    Add(T),
    /// old value, new value
    Update(T, T),
    Delete(T),
}

impl<T> Reflector<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub(super) async fn run(&self, tx: mpsc::Sender<ReflectorNotification<T>>) -> Result<()> {
        // pull the initial state
        let kvs: Vec<(String, T)> = (self.lw.lister)(()).await?;
        {
            let mut store = self.store.write().await;
            *store = HashMap::new();
            for (k, v) in kvs {
                store.insert(k, v);
            }
        }
        let (_, mut receiver) = (self.lw.watcher)(()).await?.split();

        loop {
            let msg: Message = receiver
                .next()
                .await
                .ok_or_else(|| anyhow!("Failed to receive watch message from api-server"))??;

            if msg.is_close() {
                return Err(anyhow!("Api-server watch disconnect"));
            }

            if let Message::Text(msg) = msg {
                let event: WatchEvent<T> = serde_json::from_str(msg.as_str())?;
                match event {
                    WatchEvent::Put(e) => {
                        let old = self.store.read().await.get(&e.key).cloned();
                        self.store
                            .write()
                            .await
                            .insert(e.key.to_owned(), e.object.clone());

                        if let Some(old) = old {
                            tx.send(ReflectorNotification::Update(old, e.object)).await?;
                        } else {
                            tx.send(ReflectorNotification::Add(e.object)).await?;
                        }
                    },
                    WatchEvent::Delete(e) => {
                        if let Some(old) = self.store.write().await.remove(&e.key) {
                            tx.send(ReflectorNotification::Delete(old)).await?;
                        } else {
                            tracing::warn!("Watch inconsistent, key {} already deleted", e.key);
                        }
                    },
                }
            } else {
                tracing::warn!("Receive none text watch message from api-server");
            }
        }
    }
}
