use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use futures_util::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    net::TcpStream,
    sync::{mpsc, RwLock},
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use reflector::{Reflector, ReflectorNotification};

mod reflector;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub type Store<T> = Arc<RwLock<HashMap<String, T>>>;

pub type CLS<ARG, RES> = Box<dyn Fn(ARG) -> BoxFuture<'static, Result<RES>> + Send + Sync>;

pub struct ListerWatcher<T> {
    pub lister: CLS<(), Vec<(String, T)>>,
    pub watcher: CLS<(), WsStream>,
}

pub struct EventHandler<T> {
    pub add_cls: CLS<T, ()>,
    pub update_cls: CLS<(T, T), ()>,
    pub delete_cls: CLS<T, ()>,
}

/// Caches one kind of object and invokes the event handler on changes.
pub struct Informer<T> {
    reflector: Arc<Reflector<T>>,
    eh: EventHandler<T>,
}

impl<T> Informer<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(lw: ListerWatcher<T>, eh: EventHandler<T>) -> Self {
        let reflector = Reflector {
            lw,
            store: Arc::new(RwLock::new(HashMap::new())),
        };
        Self {
            reflector: Arc::new(reflector),
            eh,
        }
    }

    pub fn get_store(&self) -> Store<T> {
        self.reflector.store.clone()
    }

    pub async fn run(&self) -> Result<()> {
        // start reflector
        let (tx, mut rx) = mpsc::channel::<ReflectorNotification<T>>(16);
        let r = self.reflector.clone();
        let reflector_handle = tokio::spawn(async move { r.run(tx).await });

        while let Some(n) = rx.recv().await {
            match n {
                ReflectorNotification::Add(new) => {
                    (self.eh.add_cls)(new).await?;
                },
                ReflectorNotification::Update(old, new) => {
                    (self.eh.update_cls)((old, new)).await?;
                },
                ReflectorNotification::Delete(old) => {
                    (self.eh.delete_cls)(old).await?;
                },
            }
        }

        reflector_handle.await?
    }
}
