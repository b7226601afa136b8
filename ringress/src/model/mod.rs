//! The routing model: virtual servers, locations, and upstream pools, plus
//! the equality reasoning behind the reload / dynamic-patch decision.

use std::collections::{
    hash_map::DefaultHasher,
    BTreeMap, BTreeSet,
};
use std::hash::Hasher;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use resources::{
    annotations::{Annotations, CaCert, CertificateAuth, ProxyConfig},
    objects::{ingress::PortRef, service::Service},
};

pub mod builder;

pub const DEF_UPSTREAM_NAME: &str = "upstream-default-backend";
pub const DEF_SERVER_NAME: &str = "_";
pub const ROOT_LOCATION: &str = "/";

/// One address a backend load-balances to. Ports are carried as strings the
/// same way the data plane consumes them.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub address: String,
    pub port: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TrafficShapingPolicy {
    pub weight: i32,
    pub header: String,
    pub cookie: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionAffinityConfig {
    pub affinity_type: String,
    pub cookie_session_affinity: CookieSessionAffinity,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CookieSessionAffinity {
    pub name: String,
    pub hash: String,
    /// Paths using cookie affinity, grouped by hostname.
    pub locations: BTreeMap<String, Vec<String>>,
}

/// A named pool of endpoints, unique by `namespace-service-port`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Backend {
    pub name: String,
    pub service: Option<Service>,
    pub port: PortRef,
    pub secure_ca_cert: CaCert,
    pub ssl_passthrough: bool,
    pub endpoints: Vec<Endpoint>,
    pub session_affinity: SessionAffinityConfig,
    pub upstream_hash_by: String,
    pub load_balancing: String,
    /// A canary backend that exists only as another backend's alternative
    /// and must never be a location's primary backend.
    pub no_server: bool,
    pub traffic_shaping_policy: TrafficShapingPolicy,
    pub alternative_backends: Vec<String>,
}

impl Backend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Explicit deep clone, used when synthesizing the
    /// `custom-default-backend-*` upstream.
    pub fn deep_copy(&self) -> Self {
        self.clone()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SSLCert {
    pub pem_file_name: String,
    pub pem_sha: String,
    /// Concatenated certificate and key, delivered over the dynamic channel
    /// when dynamic certificates are enabled.
    pub pem_cert_key: String,
    /// Hostnames the certificate is valid for (subject alternative names
    /// plus the common name), recorded by the certificate loader.
    pub names: Vec<String>,
    pub expire_time: Option<DateTime<Utc>>,
}

impl SSLCert {
    /// Matches `host` against the certificate's names, honoring a leading
    /// single-label wildcard.
    pub fn matches_host(&self, host: &str) -> bool {
        self.names.iter().any(|name| {
            if let Some(suffix) = name.strip_prefix("*.") {
                match host.split_once('.') {
                    Some((label, rest)) => !label.is_empty() && rest == suffix,
                    None => false,
                }
            } else {
                name == host
            }
        })
    }
}

/// A virtual host, unique by hostname within a model.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub hostname: String,
    pub ssl_passthrough: bool,
    pub ssl_cert: SSLCert,
    pub ssl_ciphers: String,
    pub alias: String,
    pub redirect_from_to_www: bool,
    pub certificate_auth: CertificateAuth,
    pub auth_tls_error: String,
    pub server_snippet: String,
    pub locations: Vec<Location>,
}

/// A path-matched binding of a server to an upstream. An empty `backend`
/// means no active upstream; the template renders it as a 503.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub path: String,
    pub is_def_backend: bool,
    pub backend: String,
    pub service: Option<Service>,
    pub port: PortRef,
    /// `namespace/name` of the ingress the location was derived from.
    pub ingress: Option<String>,
    pub proxy: ProxyConfig,
    pub annotations: Annotations,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SSLPassthroughBackend {
    pub backend: String,
    pub hostname: String,
    pub service: Option<Service>,
    pub port: PortRef,
}

/// The complete routing intent materialized by one reconciliation.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    pub backends: Vec<Backend>,
    pub servers: Vec<Server>,
    pub passthrough_backends: Vec<SSLPassthroughBackend>,
    pub backend_config_checksum: String,
    pub configuration_checksum: String,
}

impl Configuration {
    /// Structural equality driving the no-op decision. The configuration
    /// checksum is derived from the rest of the model and ignored here.
    pub fn equal(&self, other: &Configuration) -> bool {
        self.backends == other.backends
            && self.servers == other.servers
            && self.passthrough_backends == other.passthrough_backends
            && self.backend_config_checksum == other.backend_config_checksum
    }

    /// Stable structural hash over the serialized model, stamped into the
    /// rendered configuration so reloads are observable.
    pub fn checksum(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        let mut hasher = DefaultHasher::new();
        hasher.write(&bytes);
        Ok(format!("{}", hasher.finish()))
    }
}

/// Reduces every server's certificate to its file path so that rotation of
/// the PEM material alone compares equal.
pub fn clear_certificates(config: &mut Configuration) {
    for server in &mut config.servers {
        server.ssl_cert = SSLCert {
            pem_file_name: server.ssl_cert.pem_file_name.clone(),
            ..Default::default()
        };
    }
}

/// Whether `new` differs from `running` only in parts the data plane can
/// absorb over the admin endpoint: backend endpoints, and certificate
/// material when dynamic certificates are enabled.
pub fn is_dynamic_configuration_enough(
    running: &Configuration,
    new: &Configuration,
    dynamic_certificates: bool,
) -> bool {
    let mut running = running.clone();
    let mut new = new.clone();

    running.backends = Vec::new();
    new.backends = Vec::new();

    if dynamic_certificates {
        clear_certificates(&mut running);
        clear_certificates(&mut new);
    }

    running.equal(&new)
}

/// Hostnames no longer present in the new configuration.
pub fn removed_hosts(running: &Configuration, new: &Configuration) -> Vec<String> {
    let old: BTreeSet<&String> = running.servers.iter().map(|s| &s.hostname).collect();
    let keep: BTreeSet<&String> = new.servers.iter().map(|s| &s.hostname).collect();
    old.difference(&keep).map(|h| h.to_string()).collect()
}

/// Ingress keys no longer contributing any location.
pub fn removed_ingresses(running: &Configuration, new: &Configuration) -> Vec<String> {
    let collect = |cfg: &Configuration| -> BTreeSet<String> {
        cfg.servers
            .iter()
            .flat_map(|s| s.locations.iter())
            .filter_map(|l| l.ingress.clone())
            .collect()
    };
    let old = collect(running);
    let keep = collect(new);
    old.difference(&keep).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_with_backend(endpoints: Vec<Endpoint>) -> Configuration {
        Configuration {
            backends: vec![Backend {
                name: "ns-svc-80".to_string(),
                endpoints,
                ..Default::default()
            }],
            servers: vec![Server {
                hostname: "a.example.com".to_string(),
                locations: vec![Location {
                    path: ROOT_LOCATION.to_string(),
                    backend: "ns-svc-80".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn endpoint(address: &str, port: &str) -> Endpoint {
        Endpoint {
            address: address.to_string(),
            port: port.to_string(),
        }
    }

    #[test]
    fn equal_ignores_configuration_checksum() {
        let a = model_with_backend(vec![endpoint("10.0.0.1", "8080")]);
        let mut b = a.clone();
        b.configuration_checksum = "12345".to_string();
        assert!(a.equal(&b));
    }

    #[test]
    fn equal_tracks_backend_config_checksum() {
        let a = model_with_backend(vec![endpoint("10.0.0.1", "8080")]);
        let mut b = a.clone();
        b.backend_config_checksum = "configmap-changed".to_string();
        assert!(!a.equal(&b));
    }

    #[test]
    fn endpoint_only_change_is_dynamic() {
        let running = model_with_backend(vec![endpoint("10.0.0.1", "8080")]);
        let new = model_with_backend(vec![
            endpoint("10.0.0.2", "8080"),
            endpoint("10.0.0.3", "8080"),
        ]);
        assert!(!running.equal(&new));
        assert!(is_dynamic_configuration_enough(&running, &new, false));
    }

    #[test]
    fn server_change_requires_reload() {
        let running = model_with_backend(vec![endpoint("10.0.0.1", "8080")]);
        let mut new = running.clone();
        new.servers[0].alias = "b.example.com".to_string();
        assert!(!is_dynamic_configuration_enough(&running, &new, false));
    }

    #[test]
    fn certificate_rotation_is_dynamic_only_with_dynamic_certificates() {
        let running = model_with_backend(vec![endpoint("10.0.0.1", "8080")]);
        let mut new = running.clone();
        new.servers[0].ssl_cert.pem_sha = "rotated".to_string();
        new.servers[0].ssl_cert.pem_cert_key = "rotated-pem".to_string();

        assert!(!is_dynamic_configuration_enough(&running, &new, false));
        assert!(is_dynamic_configuration_enough(&running, &new, true));
    }

    #[test]
    fn checksum_is_stable_and_sensitive() {
        let a = model_with_backend(vec![endpoint("10.0.0.1", "8080")]);
        let b = model_with_backend(vec![endpoint("10.0.0.1", "8080")]);
        assert_eq!(a.checksum().unwrap(), b.checksum().unwrap());

        let c = model_with_backend(vec![endpoint("10.0.0.9", "8080")]);
        assert_ne!(a.checksum().unwrap(), c.checksum().unwrap());
    }

    #[test]
    fn cert_host_matching_honors_wildcards() {
        let cert = SSLCert {
            names: vec!["*.example.com".to_string(), "example.org".to_string()],
            ..Default::default()
        };
        assert!(cert.matches_host("a.example.com"));
        assert!(cert.matches_host("example.org"));
        assert!(!cert.matches_host("b.a.example.com"));
        assert!(!cert.matches_host("example.com"));
    }

    #[test]
    fn removed_hosts_and_ingresses_are_set_differences() {
        let mut running = model_with_backend(vec![endpoint("10.0.0.1", "8080")]);
        running.servers[0].locations[0].ingress = Some("ns/app".to_string());
        let new = Configuration::default();

        assert_eq!(removed_hosts(&running, &new), vec!["a.example.com"]);
        assert_eq!(removed_ingresses(&running, &new), vec!["ns/app"]);
    }
}
