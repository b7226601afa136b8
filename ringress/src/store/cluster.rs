//! Informer-backed [`Storer`] implementation.
//!
//! One informer per object kind mirrors the api-server state into local
//! maps and pushes a notification into the intake ring buffer for every
//! change. Certificate material is registered by the certificate loader
//! through [`ClusterStore::add_local_cert`].

use std::{
    collections::{hash_map::DefaultHasher, BTreeMap, HashMap},
    hash::Hasher,
    sync::{Arc, RwLock},
};

use anyhow::{anyhow, Result};
use reqwest::Url;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::watch;
use tokio_tungstenite::connect_async;

use resources::{
    annotations::Annotations,
    informer::{EventHandler, Informer, ListerWatcher},
    models::Response,
    objects::{
        configmap::ConfigMap, endpoints::Endpoints, ingress::Ingress, secret::Secret,
        service::Service, Object,
    },
};

use crate::{
    config::BackendConfiguration,
    model::SSLCert,
    store::{Event, EventType, Storer},
    sync::ring::RingSender,
};

type Cache<T> = Arc<RwLock<HashMap<String, T>>>;

pub struct ClusterStore {
    api_server: Url,
    /// Namespace to watch; all namespaces when empty.
    namespace: String,
    config_map_name: String,
    resync_period: std::time::Duration,
    update_tx: RingSender<Event>,

    ingresses: Cache<Ingress>,
    services: Cache<Service>,
    endpoints: Cache<Endpoints>,
    secrets: Cache<Secret>,
    config_maps: Cache<ConfigMap>,
    local_certs: Cache<SSLCert>,
    backend_config: Arc<RwLock<BackendConfiguration>>,
}

impl ClusterStore {
    pub fn new(
        api_server: Url,
        namespace: &str,
        config_map_name: &str,
        resync_period: std::time::Duration,
        update_tx: RingSender<Event>,
    ) -> Self {
        Self {
            api_server,
            namespace: namespace.to_string(),
            config_map_name: config_map_name.to_string(),
            resync_period,
            update_tx,
            ingresses: Arc::new(RwLock::new(HashMap::new())),
            services: Arc::new(RwLock::new(HashMap::new())),
            endpoints: Arc::new(RwLock::new(HashMap::new())),
            secrets: Arc::new(RwLock::new(HashMap::new())),
            config_maps: Arc::new(RwLock::new(HashMap::new())),
            local_certs: Arc::new(RwLock::new(HashMap::new())),
            backend_config: Arc::new(RwLock::new(BackendConfiguration::default())),
        }
    }

    /// Registers certificate material placed on disk by the loader.
    pub fn add_local_cert(&self, key: &str, cert: SSLCert) {
        self.local_certs
            .write()
            .expect("cert cache poisoned")
            .insert(key.to_string(), cert);
    }

    fn create_informer<T>(&self, resource: &'static str, cache: Cache<T>) -> Informer<T>
    where
        T: Object + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let base = self.api_server.clone();
        let watch_base = self.api_server.clone();
        let query = if self.namespace.is_empty() {
            String::new()
        } else {
            format!("?namespace={}", self.namespace)
        };
        let watch_query = query.clone();
        let lw = ListerWatcher {
            lister: Box::new(move |_| {
                let base = base.clone();
                let query = query.clone();
                Box::pin(async move {
                    let res = reqwest::get(base.join(&format!("/api/v1/{}{}", resource, query))?)
                        .await?
                        .json::<Response<Vec<(String, T)>>>()
                        .await?;
                    res.data.ok_or_else(|| anyhow!("Lister failed"))
                })
            }),
            watcher: Box::new(move |_| {
                let base = watch_base.clone();
                let query = watch_query.clone();
                Box::pin(async move {
                    let mut url = base.join(&format!("/api/v1/watch/{}{}", resource, query))?;
                    url.set_scheme("ws").ok();
                    let (stream, _) = connect_async(url).await?;
                    Ok(stream)
                })
            }),
        };

        let store = self.clone_handles();
        let on_add = {
            let cache = cache.clone();
            let store = store.clone();
            move |obj: T, event_type: EventType| {
                let key = object_key(&obj);
                match event_type {
                    EventType::Delete => {
                        cache.write().expect("cache poisoned").remove(&key);
                    },
                    _ => {
                        cache
                            .write()
                            .expect("cache poisoned")
                            .insert(key.clone(), obj);
                    },
                }
                store.notify(resource, &key, event_type);
            }
        };

        let add = on_add.clone();
        let update = on_add.clone();
        let delete = on_add;
        let eh = EventHandler {
            add_cls: Box::new(move |obj: T| {
                add(obj, EventType::Create);
                Box::pin(async { Ok(()) })
            }),
            update_cls: Box::new(move |(_, new): (T, T)| {
                update(new, EventType::Update);
                Box::pin(async { Ok(()) })
            }),
            delete_cls: Box::new(move |obj: T| {
                delete(obj, EventType::Delete);
                Box::pin(async { Ok(()) })
            }),
        };

        Informer::new(lw, eh)
    }

    fn clone_handles(&self) -> StoreHandles {
        StoreHandles {
            config_map_name: self.config_map_name.clone(),
            config_maps: self.config_maps.clone(),
            backend_config: self.backend_config.clone(),
            update_tx: self.update_tx.clone(),
        }
    }
}

/// The subset of the store the informer callbacks need.
#[derive(Clone)]
struct StoreHandles {
    config_map_name: String,
    config_maps: Cache<ConfigMap>,
    backend_config: Arc<RwLock<BackendConfiguration>>,
    update_tx: RingSender<Event>,
}

impl StoreHandles {
    fn notify(&self, resource: &str, key: &str, event_type: EventType) {
        if resource == "configmaps" && key == self.config_map_name {
            self.apply_config_map();
            self.update_tx.send(Event {
                event_type: EventType::Configuration,
                obj: String::new(),
            });
            return;
        }

        self.update_tx.send(Event {
            event_type,
            obj: key.to_string(),
        });
    }

    /// Re-derives the backend configuration from the watched configmap.
    fn apply_config_map(&self) {
        let data = self
            .config_maps
            .read()
            .expect("cache poisoned")
            .get(&self.config_map_name)
            .map(|cm| cm.data.clone())
            .unwrap_or_default();

        let mut cfg = BackendConfiguration {
            checksum: config_map_checksum(&data),
            ..Default::default()
        };

        if let Some(v) = data.get("worker-processes") {
            cfg.worker_processes = v.clone();
        }
        if let Some(v) = data.get("max-worker-connections").and_then(|v| v.parse().ok()) {
            cfg.worker_connections = v;
        }
        if let Some(v) = data
            .get("server-name-hash-max-size")
            .and_then(|v| v.parse().ok())
        {
            cfg.server_name_hash_max_size = v;
        }
        if let Some(v) = data
            .get("server-name-hash-bucket-size")
            .and_then(|v| v.parse().ok())
        {
            cfg.server_name_hash_bucket_size = v;
        }
        if let Some(v) = data.get("proxy-set-headers") {
            cfg.proxy_set_headers = v.clone();
        }
        if let Some(v) = data.get("add-headers") {
            cfg.add_headers = v.clone();
        }
        if let Some(v) = data.get("ssl-dh-param") {
            cfg.ssl_dh_param = v.clone();
        }
        if let Some(v) = data.get("use-proxy-protocol") {
            cfg.use_proxy_protocol = v == "true";
        }
        if let Some(v) = data.get("enable-opentracing") {
            cfg.enable_opentracing = v == "true";
        }
        if let Some(v) = data.get("zipkin-collector-host") {
            cfg.zipkin_collector_host = v.clone();
        }
        if let Some(v) = data.get("jaeger-collector-host") {
            cfg.jaeger_collector_host = v.clone();
        }

        *self.backend_config.write().expect("config poisoned") = cfg;
    }
}

fn object_key<T: Object>(obj: &T) -> String {
    obj.meta().key()
}

fn config_map_checksum(data: &HashMap<String, String>) -> String {
    let ordered: BTreeMap<&String, &String> = data.iter().collect();
    let mut hasher = DefaultHasher::new();
    for (k, v) in ordered {
        hasher.write(k.as_bytes());
        hasher.write(v.as_bytes());
    }
    format!("{}", hasher.finish())
}

impl Storer for ClusterStore {
    fn list_ingresses(&self) -> Vec<Ingress> {
        self.ingresses
            .read()
            .expect("cache poisoned")
            .values()
            .cloned()
            .collect()
    }

    fn get_service(&self, key: &str) -> Result<Service> {
        self.services
            .read()
            .expect("cache poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("service {} does not exist", key))
    }

    fn get_service_endpoints(&self, key: &str) -> Result<Endpoints> {
        self.endpoints
            .read()
            .expect("cache poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("no endpoints for service {}", key))
    }

    fn get_secret(&self, key: &str) -> Result<Secret> {
        self.secrets
            .read()
            .expect("cache poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("secret {} does not exist", key))
    }

    fn get_config_map(&self, key: &str) -> Result<ConfigMap> {
        self.config_maps
            .read()
            .expect("cache poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("configmap {} does not exist", key))
    }

    fn get_local_ssl_cert(&self, key: &str) -> Result<SSLCert> {
        self.local_certs
            .read()
            .expect("cache poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("no local certificate for {}", key))
    }

    fn get_ingress_annotations(&self, key: &str) -> Result<Annotations> {
        let ingresses = self.ingresses.read().expect("cache poisoned");
        let ing = ingresses
            .get(key)
            .ok_or_else(|| anyhow!("ingress {} does not exist", key))?;
        Ok(Annotations::parse(&ing.metadata.annotations))
    }

    fn get_backend_configuration(&self) -> BackendConfiguration {
        self.backend_config.read().expect("config poisoned").clone()
    }

    fn run(&self, stop: watch::Receiver<bool>) {
        self.spawn_informer::<Ingress>("ingresses", self.ingresses.clone(), stop.clone());
        self.spawn_informer::<Service>("services", self.services.clone(), stop.clone());
        self.spawn_informer::<Endpoints>("endpoints", self.endpoints.clone(), stop.clone());
        self.spawn_informer::<Secret>("secrets", self.secrets.clone(), stop.clone());
        self.spawn_informer::<ConfigMap>("configmaps", self.config_maps.clone(), stop.clone());

        // periodic resync so drift never persists past one period
        let period = self.resync_period;
        let update_tx = self.update_tx.clone();
        let mut stop = stop;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.changed() => return,
                    _ = ticker.tick() => {
                        update_tx.send(Event {
                            event_type: EventType::Configuration,
                            obj: String::new(),
                        });
                    },
                }
            }
        });
    }
}

impl ClusterStore {
    fn spawn_informer<T>(&self, resource: &'static str, cache: Cache<T>, mut stop: watch::Receiver<bool>)
    where
        T: Object + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let informer = self.create_informer::<T>(resource, cache);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => return,
                    res = informer.run() => {
                        if let Err(e) = res {
                            tracing::warn!("Informer for {} stopped: {:#}, restarting", resource, e);
                        }
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    },
                }
            }
        });
    }
}
