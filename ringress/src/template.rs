//! Rendering of the final NGINX configuration text from the routing model.
//!
//! The template file provides the static skeleton; the marker words are
//! replaced with generated main directives, http directives, upstream
//! blocks, and server blocks.

use std::{collections::HashMap, path::Path};

use crate::{
    config::{BackendConfiguration, ListenPorts},
    errors::NginxError,
    model::{Backend, Server, SSLPassthroughBackend, DEF_SERVER_NAME},
};

use resources::objects::service::Service;

const MAIN_MARKER: &str = "MAIN_DIRECTIVES";
const HTTP_MARKER: &str = "HTTP_DIRECTIVES";
const UPSTREAMS_MARKER: &str = "UPSTREAMS";
const SERVERS_MARKER: &str = "SERVERS";

/// Everything the template needs to render one configuration.
pub struct TemplateConfig {
    pub proxy_set_headers: HashMap<String, String>,
    pub add_headers: HashMap<String, String>,
    pub max_open_files: i64,
    pub backlog_size: i64,
    pub backends: Vec<Backend>,
    pub passthrough_backends: Vec<SSLPassthroughBackend>,
    pub servers: Vec<Server>,
    pub healthz_uri: String,
    pub custom_errors: bool,
    pub cfg: BackendConfiguration,
    pub is_ipv6_enabled: bool,
    pub redirect_servers: HashMap<String, String>,
    pub is_ssl_passthrough_enabled: bool,
    pub listen_ports: ListenPorts,
    pub publish_service: Option<Service>,
    pub dynamic_certificates_enabled: bool,
}

#[derive(Debug)]
pub struct Template {
    raw: String,
}

impl Template {
    /// Loads and validates the template file. Missing markers make the
    /// template unusable, which is fatal at startup.
    pub fn new(path: &Path) -> Result<Self, NginxError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| NginxError::TemplateInvalid(format!("{}: {}", path.display(), e)))?;
        Self::from_raw(raw)
    }

    pub fn from_raw(raw: String) -> Result<Self, NginxError> {
        for marker in [MAIN_MARKER, HTTP_MARKER, UPSTREAMS_MARKER, SERVERS_MARKER] {
            if !raw.contains(marker) {
                return Err(NginxError::TemplateInvalid(format!(
                    "missing {} marker",
                    marker
                )));
            }
        }
        Ok(Self {
            raw,
        })
    }

    pub fn write(&self, tc: &TemplateConfig) -> Result<Vec<u8>, NginxError> {
        let out = self
            .raw
            .replace(MAIN_MARKER, &main_directives(tc))
            .replace(HTTP_MARKER, &http_directives(tc))
            .replace(UPSTREAMS_MARKER, &upstream_blocks(tc))
            .replace(SERVERS_MARKER, &server_blocks(tc));
        Ok(out.into_bytes())
    }
}

fn main_directives(tc: &TemplateConfig) -> String {
    let mut out = String::new();
    out.push_str(&format!("worker_processes {};\n", tc.cfg.worker_processes));
    out.push_str(&format!("worker_rlimit_nofile {};\n", tc.max_open_files));
    out
}

fn http_directives(tc: &TemplateConfig) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "    server_names_hash_max_size {};\n",
        tc.cfg.server_name_hash_max_size
    ));
    out.push_str(&format!(
        "    server_names_hash_bucket_size {};\n",
        tc.cfg.server_name_hash_bucket_size
    ));
    if !tc.cfg.resolver.is_empty() {
        let resolvers: Vec<String> = tc.cfg.resolver.iter().map(|ip| ip.to_string()).collect();
        out.push_str(&format!("    resolver {} valid=30s;\n", resolvers.join(" ")));
    }
    for (name, value) in &tc.proxy_set_headers {
        out.push_str(&format!("    proxy_set_header {} \"{}\";\n", name, value));
    }
    for (name, value) in &tc.add_headers {
        out.push_str(&format!("    add_header {} \"{}\";\n", name, value));
    }
    if tc.cfg.enable_opentracing {
        out.push_str("    opentracing on;\n");
    }
    out.push_str(&format!("    # checksum {}\n", tc.cfg.checksum));
    out
}

fn upstream_blocks(tc: &TemplateConfig) -> String {
    let mut out = String::new();
    for backend in &tc.backends {
        out.push_str(&format!("    upstream {} {{\n", backend.name));
        if !backend.upstream_hash_by.is_empty() {
            out.push_str(&format!(
                "        hash {} consistent;\n",
                backend.upstream_hash_by
            ));
        } else if backend.load_balancing == "least_conn" {
            out.push_str("        least_conn;\n");
        }
        for endpoint in &backend.endpoints {
            out.push_str(&format!(
                "        server {}:{};\n",
                endpoint.address, endpoint.port
            ));
        }
        out.push_str("    }\n");
    }
    out
}

fn server_blocks(tc: &TemplateConfig) -> String {
    let mut out = String::new();

    for server in &tc.servers {
        out.push_str("    server {\n");
        if server.hostname == DEF_SERVER_NAME {
            out.push_str(&format!(
                "        listen {} default_server backlog={};\n",
                tc.listen_ports.http, tc.backlog_size
            ));
        } else {
            out.push_str(&format!("        listen {};\n", tc.listen_ports.http));
        }

        if !server.ssl_cert.pem_file_name.is_empty() && !server.ssl_passthrough {
            let https = if tc.is_ssl_passthrough_enabled {
                tc.listen_ports.ssl_proxy
            } else {
                tc.listen_ports.https
            };
            out.push_str(&format!("        listen {} ssl;\n", https));
            out.push_str(&format!(
                "        ssl_certificate {};\n",
                server.ssl_cert.pem_file_name
            ));
            out.push_str(&format!(
                "        ssl_certificate_key {};\n",
                server.ssl_cert.pem_file_name
            ));
        }

        if server.alias.is_empty() {
            out.push_str(&format!("        server_name {};\n", server.hostname));
        } else {
            out.push_str(&format!(
                "        server_name {} {};\n",
                server.hostname, server.alias
            ));
        }

        if !server.ssl_ciphers.is_empty() {
            out.push_str(&format!("        ssl_ciphers {};\n", server.ssl_ciphers));
        }

        if !server.server_snippet.is_empty() {
            out.push_str(&format!("        {}\n", server.server_snippet));
        }

        if server.hostname == DEF_SERVER_NAME {
            out.push_str(&format!(
                "        location {} {{\n            return 200;\n        }}\n",
                tc.healthz_uri
            ));
        }

        for location in &server.locations {
            out.push_str(&format!("        location {} {{\n", location.path));
            if location.backend.is_empty() {
                // no active upstream for this path
                out.push_str("            return 503;\n");
            } else {
                out.push_str(&format!(
                    "            proxy_pass http://{};\n",
                    location.backend
                ));
                out.push_str(&format!(
                    "            proxy_connect_timeout {}s;\n",
                    location.proxy.connect_timeout
                ));
                out.push_str(&format!(
                    "            proxy_send_timeout {}s;\n",
                    location.proxy.send_timeout
                ));
                out.push_str(&format!(
                    "            proxy_read_timeout {}s;\n",
                    location.proxy.read_timeout
                ));
            }
            out.push_str("        }\n");
        }

        out.push_str("    }\n");
    }

    for (from, to) in &tc.redirect_servers {
        out.push_str("    server {\n");
        out.push_str(&format!("        listen {};\n", tc.listen_ports.http));
        out.push_str(&format!("        server_name {};\n", from));
        out.push_str(&format!(
            "        return 301 $scheme://{}$request_uri;\n",
            to
        ));
        out.push_str("    }\n");
    }

    out
}

const ZIPKIN_TMPL: &str = r#"{
  "service_name": "ZIPKIN_SERVICE_NAME",
  "collector_host": "ZIPKIN_COLLECTOR_HOST",
  "collector_port": ZIPKIN_COLLECTOR_PORT,
  "sample_rate": ZIPKIN_SAMPLE_RATE
}"#;

const JAEGER_TMPL: &str = r#"{
  "service_name": "JAEGER_SERVICE_NAME",
  "sampler": {
    "type": "JAEGER_SAMPLER_TYPE",
    "param": JAEGER_SAMPLER_PARAM
  },
  "reporter": {
    "localAgentHostPort": "JAEGER_COLLECTOR_HOST:JAEGER_COLLECTOR_PORT"
  }
}"#;

/// Renders the tracer configuration consumed by the OpenTracing module.
pub fn opentracing_cfg(cfg: &BackendConfiguration) -> String {
    if !cfg.zipkin_collector_host.is_empty() {
        ZIPKIN_TMPL
            .replace("ZIPKIN_SERVICE_NAME", &cfg.zipkin_service_name)
            .replace("ZIPKIN_COLLECTOR_HOST", &cfg.zipkin_collector_host)
            .replace("ZIPKIN_COLLECTOR_PORT", &format!("{}", cfg.zipkin_collector_port))
            .replace("ZIPKIN_SAMPLE_RATE", &format!("{}", cfg.zipkin_sample_rate))
    } else if !cfg.jaeger_collector_host.is_empty() {
        JAEGER_TMPL
            .replace("JAEGER_SERVICE_NAME", &cfg.jaeger_service_name)
            .replace("JAEGER_SAMPLER_TYPE", &cfg.jaeger_sampler_type)
            .replace("JAEGER_SAMPLER_PARAM", &cfg.jaeger_sampler_param)
            .replace("JAEGER_COLLECTOR_HOST", &cfg.jaeger_collector_host)
            .replace("JAEGER_COLLECTOR_PORT", &format!("{}", cfg.jaeger_collector_port))
    } else {
        "{}".to_string()
    }
}

#[cfg(test)]
pub(crate) const TEST_TEMPLATE: &str = r#"
MAIN_DIRECTIVES
events {
    worker_connections 768;
}
http {
HTTP_DIRECTIVES
UPSTREAMS
SERVERS
}
"#;

#[cfg(test)]
mod tests {
    use crate::model::{Endpoint, Location, ROOT_LOCATION};

    use super::*;

    fn test_context() -> TemplateConfig {
        TemplateConfig {
            proxy_set_headers: HashMap::new(),
            add_headers: HashMap::new(),
            max_open_files: 1024,
            backlog_size: 511,
            backends: vec![Backend {
                name: "ns-svc-80".to_string(),
                endpoints: vec![Endpoint {
                    address: "10.0.0.1".to_string(),
                    port: "8080".to_string(),
                }],
                ..Default::default()
            }],
            passthrough_backends: Vec::new(),
            servers: vec![Server {
                hostname: "a.example.com".to_string(),
                locations: vec![Location {
                    path: ROOT_LOCATION.to_string(),
                    backend: "ns-svc-80".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            healthz_uri: "/healthz".to_string(),
            custom_errors: false,
            cfg: BackendConfiguration::default(),
            is_ipv6_enabled: false,
            redirect_servers: HashMap::new(),
            is_ssl_passthrough_enabled: false,
            listen_ports: ListenPorts::default(),
            publish_service: None,
            dynamic_certificates_enabled: false,
        }
    }

    #[test]
    fn rejects_template_without_markers() {
        let err = Template::from_raw("http {}".to_string()).unwrap_err();
        assert!(matches!(err, NginxError::TemplateInvalid(_)));
    }

    #[test]
    fn renders_upstream_and_server_blocks() {
        let template = Template::from_raw(TEST_TEMPLATE.to_string()).unwrap();
        let out = String::from_utf8(template.write(&test_context()).unwrap()).unwrap();

        assert!(out.contains("upstream ns-svc-80"));
        assert!(out.contains("server 10.0.0.1:8080;"));
        assert!(out.contains("server_name a.example.com;"));
        assert!(out.contains("proxy_pass http://ns-svc-80;"));
        assert!(!out.contains(UPSTREAMS_MARKER));
    }

    #[test]
    fn empty_backend_renders_as_503() {
        let template = Template::from_raw(TEST_TEMPLATE.to_string()).unwrap();
        let mut tc = test_context();
        tc.servers[0].locations[0].backend = String::new();
        let out = String::from_utf8(template.write(&tc).unwrap()).unwrap();
        assert!(out.contains("return 503;"));
    }

    #[test]
    fn opentracing_renders_zipkin_jaeger_or_empty() {
        let mut cfg = BackendConfiguration::default();
        assert_eq!(opentracing_cfg(&cfg), "{}");

        cfg.zipkin_collector_host = "zipkin.local".to_string();
        let out = opentracing_cfg(&cfg);
        assert!(out.contains("\"collector_host\": \"zipkin.local\""));

        cfg.zipkin_collector_host = String::new();
        cfg.jaeger_collector_host = "jaeger.local".to_string();
        let out = opentracing_cfg(&cfg);
        assert!(out.contains("jaeger.local:6831"));
    }
}
