use std::{net::IpAddr, path::PathBuf, time::Duration};

/// Static settings the controller is started with.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub resync_period: Duration,

    pub namespace: String,
    pub config_map_name: String,
    pub default_service: String,
    pub default_ssl_certificate: String,

    pub publish_service: String,
    pub publish_status_address: String,
    pub update_status: bool,
    pub update_status_on_shutdown: bool,
    pub use_node_internal_ip: bool,
    pub election_id: String,

    /// Deterministic endpoint order instead of a per-build shuffle.
    pub sort_backends: bool,
    /// Reconciliations per second admitted by the token bucket.
    pub sync_rate_limit: f32,

    pub listen_ports: ListenPorts,

    pub enable_ssl_passthrough: bool,
    pub enable_ssl_chain_completion: bool,
    pub dynamic_certificates_enabled: bool,

    /// Self-signed fallback generated at startup, used whenever no secret
    /// matches a server.
    pub fake_certificate_path: String,
    pub fake_certificate_sha: String,

    pub nginx_binary: String,
    pub cfg_path: PathBuf,
    pub template_path: PathBuf,
    pub geoip_path: PathBuf,
    pub opentracing_cfg_path: PathBuf,
}

#[derive(Debug, Clone, Copy)]
pub struct ListenPorts {
    pub http: u16,
    pub https: u16,
    /// Admin endpoint of the data plane, targeted by dynamic patches.
    pub status: u16,
    pub ssl_proxy: u16,
    /// Local port backing `upstream-default-backend` when no default
    /// service is configured.
    pub default: u16,
}

impl Default for ListenPorts {
    fn default() -> Self {
        Self {
            http: 80,
            https: 443,
            status: 18080,
            ssl_proxy: 442,
            default: 8181,
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            resync_period: Duration::from_secs(600),
            namespace: String::new(),
            config_map_name: String::new(),
            default_service: String::new(),
            default_ssl_certificate: String::new(),
            publish_service: String::new(),
            publish_status_address: String::new(),
            update_status: false,
            update_status_on_shutdown: true,
            use_node_internal_ip: false,
            election_id: "ingress-controller-leader".to_string(),
            sort_backends: false,
            sync_rate_limit: 0.3,
            listen_ports: ListenPorts::default(),
            enable_ssl_passthrough: false,
            enable_ssl_chain_completion: false,
            dynamic_certificates_enabled: false,
            fake_certificate_path: "/etc/nginx/ssl/default-fake-certificate.pem".to_string(),
            fake_certificate_sha: String::new(),
            nginx_binary: "nginx".to_string(),
            cfg_path: PathBuf::from("/etc/nginx/nginx.conf"),
            template_path: PathBuf::from("/etc/nginx/template/nginx.tmpl"),
            geoip_path: PathBuf::from("/etc/nginx/geoip"),
            opentracing_cfg_path: PathBuf::from("/etc/nginx/opentracing.json"),
        }
    }
}

/// Runtime configuration assembled from the watched configmap, merged into
/// the routing model on every reload.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendConfiguration {
    /// Checksum of the source configmap; a change forces a reload.
    pub checksum: String,

    pub worker_processes: String,
    pub worker_connections: usize,
    pub server_name_hash_bucket_size: usize,
    pub server_name_hash_max_size: usize,

    /// `namespace/name` of a configmap holding extra `proxy_set_header`
    /// directives.
    pub proxy_set_headers: String,
    /// `namespace/name` of a configmap holding extra `add_header`
    /// directives.
    pub add_headers: String,
    /// `namespace/name` of the secret carrying `dhparam.pem`.
    pub ssl_dh_param: String,

    pub enable_opentracing: bool,
    pub zipkin_collector_host: String,
    pub zipkin_collector_port: u16,
    pub zipkin_service_name: String,
    pub zipkin_sample_rate: f32,
    pub jaeger_collector_host: String,
    pub jaeger_collector_port: u16,
    pub jaeger_service_name: String,
    pub jaeger_sampler_type: String,
    pub jaeger_sampler_param: String,

    pub use_proxy_protocol: bool,
    pub proxy_protocol_header_timeout: Duration,

    pub disable_ipv6: bool,
    pub custom_http_errors: Vec<u16>,
    pub nginx_status_ipv4_whitelist: Vec<String>,
    pub nginx_status_ipv6_whitelist: Vec<String>,

    /// System resolvers handed to the template for `resolver` directives.
    pub resolver: Vec<IpAddr>,

    // defaults applied to every location's proxy behavior
    pub proxy_body_size: String,
    pub proxy_connect_timeout: u32,
    pub proxy_send_timeout: u32,
    pub proxy_read_timeout: u32,
    pub proxy_buffer_size: String,
    pub proxy_cookie_domain: String,
    pub proxy_cookie_path: String,
    pub proxy_next_upstream: String,
    pub proxy_next_upstream_tries: u32,
    pub proxy_request_buffering: String,
    pub proxy_redirect_from: String,
    pub proxy_buffering: String,
}

impl Default for BackendConfiguration {
    fn default() -> Self {
        Self {
            checksum: String::new(),
            worker_processes: "auto".to_string(),
            worker_connections: 16384,
            server_name_hash_bucket_size: 0,
            server_name_hash_max_size: 1024,
            proxy_set_headers: String::new(),
            add_headers: String::new(),
            ssl_dh_param: String::new(),
            enable_opentracing: false,
            zipkin_collector_host: String::new(),
            zipkin_collector_port: 9411,
            zipkin_service_name: "nginx".to_string(),
            zipkin_sample_rate: 1.0,
            jaeger_collector_host: String::new(),
            jaeger_collector_port: 6831,
            jaeger_service_name: "nginx".to_string(),
            jaeger_sampler_type: "const".to_string(),
            jaeger_sampler_param: "1".to_string(),
            use_proxy_protocol: false,
            proxy_protocol_header_timeout: Duration::from_secs(5),
            disable_ipv6: false,
            custom_http_errors: Vec::new(),
            nginx_status_ipv4_whitelist: vec!["127.0.0.1".to_string()],
            nginx_status_ipv6_whitelist: vec!["::1".to_string()],
            resolver: Vec::new(),
            proxy_body_size: "1m".to_string(),
            proxy_connect_timeout: 5,
            proxy_send_timeout: 60,
            proxy_read_timeout: 60,
            proxy_buffer_size: "4k".to_string(),
            proxy_cookie_domain: "off".to_string(),
            proxy_cookie_path: "off".to_string(),
            proxy_next_upstream: "error timeout".to_string(),
            proxy_next_upstream_tries: 3,
            proxy_request_buffering: "on".to_string(),
            proxy_redirect_from: "off".to_string(),
            proxy_buffering: "off".to_string(),
        }
    }
}
