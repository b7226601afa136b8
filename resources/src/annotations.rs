//! Structured routing policy extracted from an ingress's annotations.
//!
//! Parsing is a pure function over the annotation map; the reconciliation
//! engine only ever sees the structured record.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

const PREFIX: &str = "nginx.ingress.kubernetes.io";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Annotations {
    pub alias: String,
    pub server_snippet: String,
    pub configuration_snippet: String,
    pub ssl_ciphers: String,
    pub ssl_passthrough: bool,
    /// Use the service's virtual IP as the single upstream endpoint instead
    /// of the expanded endpoint list.
    pub service_upstream: bool,
    pub upstream_hash_by: String,
    pub load_balancing: String,
    pub secure_upstream: SecureUpstream,
    pub certificate_auth: CertificateAuth,
    pub session_affinity: SessionAffinity,
    pub canary: Canary,
    /// `namespace/name` of a service that serves traffic when the location's
    /// own upstream has no endpoints.
    pub default_backend: String,
    pub redirect: Redirect,
    pub rewrite: Rewrite,
    pub proxy: ProxyConfig,
    pub cors: CorsConfig,
    pub whitelist: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SecureUpstream {
    pub ca_cert: CaCert,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CaCert {
    pub secret: String,
    pub ca_file_name: String,
    pub pem_sha: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CertificateAuth {
    pub secret: String,
    pub ca_file_name: String,
    pub verify_depth: u8,
    pub auth_tls_error: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionAffinity {
    /// Currently `cookie` is the only recognized affinity type.
    #[serde(rename = "type")]
    pub affinity_type: String,
    pub cookie: CookieConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CookieConfig {
    pub name: String,
    pub hash: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Canary {
    pub enabled: bool,
    pub weight: i32,
    pub header: String,
    pub cookie: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Redirect {
    pub url: String,
    pub code: u16,
    pub from_to_www: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Rewrite {
    pub target: String,
    pub use_regex: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allow_origin: String,
    pub allow_methods: String,
}

/// Per-location proxy behavior, seeded from the cluster-wide defaults and
/// overridable per ingress.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyConfig {
    pub body_size: String,
    pub connect_timeout: u32,
    pub send_timeout: u32,
    pub read_timeout: u32,
    pub buffer_size: String,
    pub cookie_domain: String,
    pub cookie_path: String,
    pub next_upstream: String,
    pub next_upstream_tries: u32,
    pub request_buffering: String,
    pub proxy_redirect_from: String,
    pub proxy_buffering: String,
}

impl Annotations {
    /// Extracts the structured record from a raw annotation map. Unknown
    /// keys are ignored, malformed values fall back to the zero value.
    pub fn parse(raw: &HashMap<String, String>) -> Self {
        let get = |name: &str| raw.get(&format!("{}/{}", PREFIX, name));
        let get_bool = |name: &str| {
            get(name)
                .map(|v| v.trim() == "true")
                .unwrap_or_default()
        };
        let get_string = |name: &str| get(name).cloned().unwrap_or_default();

        Annotations {
            alias: get_string("server-alias"),
            server_snippet: get_string("server-snippet"),
            configuration_snippet: get_string("configuration-snippet"),
            ssl_ciphers: get_string("ssl-ciphers"),
            ssl_passthrough: get_bool("ssl-passthrough"),
            service_upstream: get_bool("service-upstream"),
            upstream_hash_by: get_string("upstream-hash-by"),
            load_balancing: get_string("load-balance"),
            certificate_auth: CertificateAuth {
                secret: get_string("auth-tls-secret"),
                ..Default::default()
            },
            session_affinity: SessionAffinity {
                affinity_type: get_string("affinity"),
                cookie: CookieConfig {
                    name: get_string("session-cookie-name"),
                    hash: get_string("session-cookie-hash"),
                },
            },
            canary: Canary {
                enabled: get_bool("canary"),
                weight: get("canary-weight")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_default(),
                header: get_string("canary-by-header"),
                cookie: get_string("canary-by-cookie"),
            },
            default_backend: get_string("default-backend"),
            redirect: Redirect {
                url: get_string("permanent-redirect"),
                code: 301,
                from_to_www: get_bool("from-to-www-redirect"),
            },
            rewrite: Rewrite {
                target: get_string("rewrite-target"),
                use_regex: get_bool("use-regex"),
            },
            whitelist: get("whitelist-source-range")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (format!("{}/{}", PREFIX, k), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_canary_record() {
        let anns = Annotations::parse(&raw(&[
            ("canary", "true"),
            ("canary-weight", "20"),
            ("canary-by-header", "x-canary"),
        ]));
        assert!(anns.canary.enabled);
        assert_eq!(anns.canary.weight, 20);
        assert_eq!(anns.canary.header, "x-canary");
    }

    #[test]
    fn unknown_keys_fall_back_to_defaults() {
        let anns = Annotations::parse(&raw(&[("no-such-annotation", "x")]));
        assert_eq!(anns, Annotations::default());
    }

    #[test]
    fn parses_session_affinity() {
        let anns = Annotations::parse(&raw(&[
            ("affinity", "cookie"),
            ("session-cookie-name", "route"),
            ("session-cookie-hash", "sha1"),
        ]));
        assert_eq!(anns.session_affinity.affinity_type, "cookie");
        assert_eq!(anns.session_affinity.cookie.name, "route");
    }
}
