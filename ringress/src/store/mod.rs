//! The cluster-state store consumed by the reconciler.
//!
//! The engine only depends on the [`Storer`] trait; the informer-backed
//! implementation lives in [`cluster`] and pushes change notifications into
//! the intake ring buffer.

use anyhow::Result;
use tokio::sync::watch;

use resources::{
    annotations::Annotations,
    objects::{
        configmap::ConfigMap, endpoints::Endpoints, ingress::Ingress, secret::Secret,
        service::Service,
    },
};

use crate::{config::BackendConfiguration, model::SSLCert};

pub mod cluster;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Create,
    Update,
    Delete,
    /// The configmap or backend policy changed; carries no object key.
    Configuration,
}

/// A change notification pushed into the intake ring buffer.
#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: EventType,
    /// `namespace/name` of the changed object, empty for configuration
    /// events.
    pub obj: String,
}

/// Read access to the informer caches.
pub trait Storer: Send + Sync {
    fn list_ingresses(&self) -> Vec<Ingress>;

    fn get_service(&self, key: &str) -> Result<Service>;

    fn get_service_endpoints(&self, key: &str) -> Result<Endpoints>;

    fn get_secret(&self, key: &str) -> Result<Secret>;

    fn get_config_map(&self, key: &str) -> Result<ConfigMap>;

    fn get_local_ssl_cert(&self, key: &str) -> Result<SSLCert>;

    fn get_ingress_annotations(&self, key: &str) -> Result<Annotations>;

    fn get_backend_configuration(&self) -> BackendConfiguration;

    /// Defaults applied to every backend, sourced from the same configmap.
    fn get_default_backend(&self) -> BackendConfiguration {
        self.get_backend_configuration()
    }

    /// Starts the informers; returns immediately, loops exit when the stop
    /// channel fires.
    fn run(&self, stop: watch::Receiver<bool>);
}

#[cfg(test)]
pub mod test_support {
    use std::{collections::HashMap, sync::RwLock};

    use anyhow::anyhow;

    use super::*;

    /// In-memory store backing the unit and scenario tests.
    #[derive(Default)]
    pub struct MockStore {
        pub ingresses: RwLock<Vec<Ingress>>,
        pub services: RwLock<HashMap<String, Service>>,
        pub endpoints: RwLock<HashMap<String, Endpoints>>,
        pub secrets: RwLock<HashMap<String, Secret>>,
        pub config_maps: RwLock<HashMap<String, ConfigMap>>,
        pub certs: RwLock<HashMap<String, SSLCert>>,
        pub annotations: RwLock<HashMap<String, Annotations>>,
        pub backend_config: RwLock<BackendConfiguration>,
    }

    impl MockStore {
        pub fn add_service(&self, key: &str, svc: Service) {
            self.services.write().unwrap().insert(key.to_string(), svc);
        }

        pub fn add_endpoints(&self, key: &str, eps: Endpoints) {
            self.endpoints.write().unwrap().insert(key.to_string(), eps);
        }

        pub fn add_ingress(&self, ing: Ingress) {
            self.ingresses.write().unwrap().push(ing);
        }

        pub fn add_annotations(&self, key: &str, anns: Annotations) {
            self.annotations
                .write()
                .unwrap()
                .insert(key.to_string(), anns);
        }

        pub fn add_cert(&self, key: &str, cert: SSLCert) {
            self.certs.write().unwrap().insert(key.to_string(), cert);
        }
    }

    impl Storer for MockStore {
        fn list_ingresses(&self) -> Vec<Ingress> {
            self.ingresses.read().unwrap().clone()
        }

        fn get_service(&self, key: &str) -> Result<Service> {
            self.services
                .read()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| anyhow!("service {} does not exist", key))
        }

        fn get_service_endpoints(&self, key: &str) -> Result<Endpoints> {
            self.endpoints
                .read()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| anyhow!("no endpoints for service {}", key))
        }

        fn get_secret(&self, key: &str) -> Result<Secret> {
            self.secrets
                .read()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| anyhow!("secret {} does not exist", key))
        }

        fn get_config_map(&self, key: &str) -> Result<ConfigMap> {
            self.config_maps
                .read()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| anyhow!("configmap {} does not exist", key))
        }

        fn get_local_ssl_cert(&self, key: &str) -> Result<SSLCert> {
            self.certs
                .read()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| anyhow!("no local certificate for {}", key))
        }

        fn get_ingress_annotations(&self, key: &str) -> Result<Annotations> {
            Ok(self
                .annotations
                .read()
                .unwrap()
                .get(key)
                .cloned()
                .unwrap_or_default())
        }

        fn get_backend_configuration(&self) -> BackendConfiguration {
            self.backend_config.read().unwrap().clone()
        }

        fn run(&self, _stop: watch::Receiver<bool>) {}
    }
}
