//! Deterministic assembly of the routing model from the ingress set.
//!
//! The builder is a pure function over the store snapshot: for a given
//! ingress list (sorted by resource version) and a fixed shuffle seed the
//! output model is identical across runs.

use std::collections::{HashMap, HashSet};

use chrono::{Duration, Utc};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use resources::{
    annotations::{Annotations, ProxyConfig},
    objects::{
        endpoints::Protocol,
        ingress::{Ingress, IngressService, PortRef},
        service::{Service, ServicePort, ServiceType},
    },
};

use crate::{
    config::ControllerConfig,
    model::{
        Backend, Endpoint, Location, Server, SSLCert, TrafficShapingPolicy, DEF_SERVER_NAME,
        DEF_UPSTREAM_NAME, ROOT_LOCATION,
    },
    store::Storer,
};

/// `namespace-service-port`, the globally unique upstream key.
pub fn upstream_name(namespace: &str, service: &str, port: &PortRef) -> String {
    format!("{}-{}-{}", namespace, service, port)
}

fn normalize_host(host: &Option<String>) -> String {
    match host {
        Some(h) if !h.is_empty() => h.clone(),
        _ => DEF_SERVER_NAME.to_string(),
    }
}

pub struct ModelBuilder<'a> {
    store: &'a dyn Storer,
    cfg: &'a ControllerConfig,
    /// Seed for the endpoint shuffle applied when `sort_backends` is off.
    shuffle_seed: u64,
}

impl<'a> ModelBuilder<'a> {
    pub fn new(store: &'a dyn Storer, cfg: &'a ControllerConfig, shuffle_seed: u64) -> Self {
        Self {
            store,
            cfg,
            shuffle_seed,
        }
    }

    /// The endpoint of the local default server answering 404s.
    fn default_endpoint(&self) -> Endpoint {
        Endpoint {
            address: "127.0.0.1".to_string(),
            port: format!("{}", self.cfg.listen_ports.default),
        }
    }

    fn annotations(&self, ing_key: &str) -> Annotations {
        match self.store.get_ingress_annotations(ing_key) {
            Ok(anns) => anns,
            Err(e) => {
                tracing::error!("Error getting Ingress annotations {}: {:#}", ing_key, e);
                Annotations::default()
            },
        }
    }

    fn proxy_defaults(&self) -> ProxyConfig {
        let bdef = self.store.get_default_backend();
        ProxyConfig {
            body_size: bdef.proxy_body_size,
            connect_timeout: bdef.proxy_connect_timeout,
            send_timeout: bdef.proxy_send_timeout,
            read_timeout: bdef.proxy_read_timeout,
            buffer_size: bdef.proxy_buffer_size,
            cookie_domain: bdef.proxy_cookie_domain,
            cookie_path: bdef.proxy_cookie_path,
            next_upstream: bdef.proxy_next_upstream,
            next_upstream_tries: bdef.proxy_next_upstream_tries,
            request_buffering: bdef.proxy_request_buffering,
            proxy_redirect_from: bdef.proxy_redirect_from,
            proxy_buffering: bdef.proxy_buffering,
        }
    }

    /// Builds the upstream and server lists for the given ingresses, which
    /// must already be sorted by resource version.
    pub fn get_backend_servers(&self, ingresses: &[Ingress]) -> (Vec<Backend>, Vec<Server>) {
        let du = self.get_default_upstream();
        let mut upstreams = self.create_upstreams(ingresses, &du);
        let mut servers = self.create_servers(ingresses, &upstreams, &du);

        let ngx_proxy = self.proxy_defaults();

        for ing in ingresses {
            let ing_key = ing.metadata.key();
            let anns = self.annotations(&ing_key);

            for rule in &ing.spec.rules {
                let host = normalize_host(&rule.host);
                let server_host = if servers.contains_key(&host) {
                    host.clone()
                } else {
                    DEF_SERVER_NAME.to_string()
                };

                if rule.paths.is_empty() && host != DEF_SERVER_NAME {
                    tracing::debug!(
                        "Ingress {} does not contain any HTTP rule, using default backend",
                        ing_key
                    );
                    continue;
                }

                {
                    let server = servers.get_mut(&server_host).expect("default server exists");

                    if server.auth_tls_error.is_empty()
                        && !anns.certificate_auth.auth_tls_error.is_empty()
                    {
                        server.auth_tls_error = anns.certificate_auth.auth_tls_error.clone();
                    }

                    if server.certificate_auth.ca_file_name.is_empty() {
                        server.certificate_auth = anns.certificate_auth.clone();
                        if !server.certificate_auth.secret.is_empty()
                            && server.certificate_auth.ca_file_name.is_empty()
                        {
                            tracing::debug!(
                                "Secret {} has no 'ca.crt' key, mutual authentication disabled for Ingress {}",
                                server.certificate_auth.secret,
                                ing_key
                            );
                        }
                    } else {
                        tracing::debug!(
                            "Server {} is already configured for mutual authentication (Ingress {})",
                            server.hostname,
                            ing_key
                        );
                    }
                }

                if rule.paths.is_empty() {
                    tracing::debug!(
                        "Ingress {} does not contain any HTTP rule, using default backend",
                        ing_key
                    );
                    continue;
                }

                for path in &rule.paths {
                    let ups_name =
                        upstream_name(&ing.metadata.namespace, &path.service.name, &path.service.port);

                    let (ups_no_server, ups_port, ups_service) = match upstreams.get(&ups_name) {
                        Some(u) => (u.no_server, u.port.clone(), u.service.clone()),
                        None => continue,
                    };

                    // backend is not referenced by a server
                    if ups_no_server {
                        continue;
                    }

                    let nginx_path = if path.path.is_empty() {
                        ROOT_LOCATION.to_string()
                    } else {
                        path.path.clone()
                    };

                    let effective_proxy = if anns.proxy == ProxyConfig::default() {
                        ngx_proxy.clone()
                    } else {
                        anns.proxy.clone()
                    };

                    let server = servers.get_mut(&server_host).expect("default server exists");
                    let mut redirect_from_to_www = false;

                    match server.locations.iter().position(|l| l.path == nginx_path) {
                        Some(idx) => {
                            let loc = &mut server.locations[idx];
                            if !loc.is_def_backend {
                                tracing::debug!(
                                    "Location {} already configured for server {} with upstream {} (Ingress {})",
                                    loc.path,
                                    server_host,
                                    loc.backend,
                                    ing_key
                                );
                            } else {
                                tracing::debug!(
                                    "Replacing location {} for server {} with upstream {} to use upstream {} (Ingress {})",
                                    loc.path,
                                    server_host,
                                    loc.backend,
                                    ups_name,
                                    ing_key
                                );

                                loc.backend = ups_name.clone();
                                loc.is_def_backend = false;
                                loc.port = ups_port.clone();
                                loc.service = ups_service.clone();
                                loc.ingress = Some(ing_key.clone());
                                loc.proxy = effective_proxy;
                                loc.annotations = anns.clone();
                                redirect_from_to_www = anns.redirect.from_to_www;
                            }
                        },
                        None => {
                            tracing::debug!(
                                "Adding location {} for server {} with upstream {} (Ingress {})",
                                nginx_path,
                                server_host,
                                ups_name,
                                ing_key
                            );

                            server.locations.push(Location {
                                path: nginx_path,
                                is_def_backend: false,
                                backend: ups_name.clone(),
                                service: ups_service.clone(),
                                port: ups_port.clone(),
                                ingress: Some(ing_key.clone()),
                                proxy: effective_proxy,
                                annotations: anns.clone(),
                            });
                            redirect_from_to_www = anns.redirect.from_to_www;
                        },
                    }

                    if redirect_from_to_www {
                        server.redirect_from_to_www = true;
                    }

                    let ups = upstreams.get_mut(&ups_name).expect("upstream exists");
                    if ups.session_affinity.affinity_type.is_empty() {
                        ups.session_affinity.affinity_type =
                            anns.session_affinity.affinity_type.clone();
                    }

                    if anns.session_affinity.affinity_type == "cookie" {
                        let cookie = &mut ups.session_affinity.cookie_session_affinity;
                        cookie.name = anns.session_affinity.cookie.name.clone();
                        cookie.hash = anns.session_affinity.cookie.hash.clone();
                        cookie
                            .locations
                            .entry(host.clone())
                            .or_default()
                            .push(path.path.clone());
                    }
                }
            }

            if anns.canary.enabled {
                tracing::info!(
                    "Canary ingress {} detected. Finding eligible backends to merge into.",
                    ing.metadata.name
                );
                merge_alternative_backends(ing, &mut upstreams, &mut servers);
            }
        }

        let mut a_upstreams: Vec<Backend> = Vec::new();
        let mut custom_added: HashSet<String> = HashSet::new();

        let mut upstream_names: Vec<String> = upstreams.keys().cloned().collect();
        upstream_names.sort();

        for uname in &upstream_names {
            let snapshot = upstreams.get(uname).expect("upstream exists").clone();
            let mut is_https_from = false;

            for server in servers.values_mut() {
                let server_passthrough = server.ssl_passthrough;
                let hostname = server.hostname.clone();

                for loc in server.locations.iter_mut() {
                    if loc.backend != *uname {
                        continue;
                    }

                    if snapshot.endpoints.is_empty() {
                        tracing::debug!("Upstream {} has no active Endpoint", uname);

                        // the template renders an empty backend as a 503
                        loc.backend = String::new();

                        if !loc.annotations.default_backend.is_empty() {
                            if let Some(nb) = self.custom_default_backend(
                                &snapshot,
                                &loc.annotations.default_backend,
                                &loc.path,
                                &hostname,
                            ) {
                                loc.backend = nb.name.clone();
                                if custom_added.insert(nb.name.clone()) {
                                    a_upstreams.push(nb);
                                }
                            }
                        }
                    }

                    if server_passthrough && loc.path == ROOT_LOCATION {
                        if loc.backend == DEF_UPSTREAM_NAME {
                            tracing::warn!(
                                "Server {} has no default backend, ignoring SSL Passthrough.",
                                hostname
                            );
                            continue;
                        }
                        is_https_from = true;
                    }
                }
            }

            if is_https_from {
                upstreams
                    .get_mut(uname)
                    .expect("upstream exists")
                    .ssl_passthrough = true;
            }
        }

        // skip upstreams without endpoints
        for uname in &upstream_names {
            let ups = upstreams.get(uname).expect("upstream exists");
            if !ups.endpoints.is_empty() {
                a_upstreams.push(ups.clone());
            }
        }

        a_upstreams.sort_by(|a, b| a.name.cmp(&b.name));

        let mut a_servers: Vec<Server> = servers.into_values().collect();
        for server in &mut a_servers {
            server.locations.sort_by(|a, b| b.path.cmp(&a.path));
            server.locations.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        }
        a_servers.sort_by(|a, b| a.hostname.cmp(&b.hostname));

        (a_upstreams, a_servers)
    }

    /// Clones a dead upstream into `custom-default-backend-<name>` when the
    /// location carries a resolvable custom default backend.
    fn custom_default_backend(
        &self,
        template: &Backend,
        default_backend_key: &str,
        path: &str,
        hostname: &str,
    ) -> Option<Backend> {
        let svc = match self.store.get_service(default_backend_key) {
            Ok(svc) => svc,
            Err(e) => {
                tracing::warn!(
                    "Error getting custom default backend {}: {:#}",
                    default_backend_key,
                    e
                );
                return None;
            },
        };

        let sp = svc.spec.ports.first()?.clone();
        let endps = self.get_endpoints(&svc, &sp);
        if endps.is_empty() {
            return None;
        }

        tracing::debug!(
            "Using custom default backend for location {} in server {} (Service {})",
            path,
            hostname,
            default_backend_key
        );

        let mut nb = template.deep_copy();
        nb.name = format!("custom-default-backend-{}", template.name);
        nb.endpoints = endps;
        Some(nb)
    }

    /// Returns the upstream associated with the default backend; falls back
    /// to the local port answering 503/404 when nothing is configured.
    fn get_default_upstream(&self) -> Backend {
        let mut upstream = Backend::new(DEF_UPSTREAM_NAME);
        let svc_key = &self.cfg.default_service;

        if svc_key.is_empty() {
            upstream.endpoints.push(self.default_endpoint());
            return upstream;
        }

        let svc = match self.store.get_service(svc_key) {
            Ok(svc) => svc,
            Err(e) => {
                tracing::warn!("Error getting default backend {}: {:#}", svc_key, e);
                upstream.endpoints.push(self.default_endpoint());
                return upstream;
            },
        };

        let endps = match svc.spec.ports.first() {
            Some(port) => self.get_endpoints(&svc, port),
            None => Vec::new(),
        };
        if endps.is_empty() {
            tracing::warn!("Service {} does not have any active Endpoint", svc_key);
            upstream.endpoints.push(self.default_endpoint());
        } else {
            upstream.endpoints = endps;
        }

        upstream.service = Some(svc);
        upstream
    }

    /// Creates one upstream per service+port referenced by the ingresses.
    /// First occurrence wins; later occurrences only fill empty fields.
    fn create_upstreams(&self, ingresses: &[Ingress], du: &Backend) -> HashMap<String, Backend> {
        let mut upstreams: HashMap<String, Backend> = HashMap::new();
        upstreams.insert(DEF_UPSTREAM_NAME.to_string(), du.clone());

        for ing in ingresses {
            let ing_key = ing.metadata.key();
            let anns = self.annotations(&ing_key);

            if let Some(backend) = &ing.spec.backend {
                let name =
                    upstream_name(&ing.metadata.namespace, &backend.name, &backend.port);
                tracing::debug!("Creating upstream {}", name);

                self.populate_upstream(&mut upstreams, &name, backend, ing, &anns, false);
            }

            for rule in &ing.spec.rules {
                if rule.paths.is_empty() {
                    continue;
                }

                for path in &rule.paths {
                    let name = upstream_name(
                        &ing.metadata.namespace,
                        &path.service.name,
                        &path.service.port,
                    );

                    if upstreams.contains_key(&name) {
                        let ups = upstreams.get_mut(&name).expect("upstream exists");
                        fill_empty_policy(ups, &anns);
                        continue;
                    }

                    tracing::debug!("Creating upstream {}", name);
                    self.populate_upstream(&mut upstreams, &name, &path.service, ing, &anns, true);
                }
            }
        }

        upstreams
    }

    fn populate_upstream(
        &self,
        upstreams: &mut HashMap<String, Backend>,
        name: &str,
        backend: &IngressService,
        ing: &Ingress,
        anns: &Annotations,
        set_service: bool,
    ) {
        let ups = upstreams
            .entry(name.to_string())
            .or_insert_with(|| Backend::new(name));
        if set_service {
            ups.port = backend.port.clone();
        }
        fill_empty_policy(ups, anns);

        let svc_key = format!("{}/{}", ing.metadata.namespace, backend.name);

        // use the service virtual IP as a single endpoint
        if anns.service_upstream {
            match self.get_service_cluster_endpoint(&svc_key, backend) {
                Ok(endpoint) => ups.endpoints = vec![endpoint],
                Err(e) => tracing::error!(
                    "Failed to determine a suitable ClusterIP Endpoint for Service {}: {:#}",
                    svc_key,
                    e
                ),
            }
        }

        // traffic shaping for canary
        if anns.canary.enabled {
            ups.no_server = true;
            ups.traffic_shaping_policy = TrafficShapingPolicy {
                weight: anns.canary.weight,
                header: anns.canary.header.clone(),
                cookie: anns.canary.cookie.clone(),
            };
        }

        if ups.endpoints.is_empty() {
            match self.service_endpoints(&svc_key, &backend.port) {
                Ok(endps) => ups.endpoints.extend(endps),
                Err(e) => {
                    tracing::warn!("Error creating upstream {}: {:#}", name, e);
                    return;
                },
            }
        }

        if set_service {
            match self.store.get_service(&svc_key) {
                Ok(svc) => ups.service = Some(svc),
                Err(e) => tracing::warn!("Error obtaining Service {}: {:#}", svc_key, e),
            }
        }
    }

    /// An Endpoint carrying the service's virtual IP, resolving named
    /// ports through the service spec.
    fn get_service_cluster_endpoint(
        &self,
        svc_key: &str,
        backend: &IngressService,
    ) -> anyhow::Result<Endpoint> {
        let svc = self.store.get_service(svc_key)?;

        let cluster_ip = match &svc.spec.cluster_ip {
            Some(ip) if !ip.is_empty() && ip != "None" => ip.clone(),
            _ => anyhow::bail!("no ClusterIP found for Service {}", svc_key),
        };

        let port = match &backend.port {
            PortRef::Name(name) => match svc.lookup_port(name) {
                Some(port) => format!("{}", port),
                None => anyhow::bail!(
                    "service {} does not have a port named {}",
                    svc.metadata.name,
                    name
                ),
            },
            PortRef::Number(n) => format!("{}", n),
        };

        Ok(Endpoint {
            address: cluster_ip,
            port,
        })
    }

    /// Expands the endpoints behind a service port, matched by number, by
    /// name, or by target port.
    fn service_endpoints(&self, svc_key: &str, backend_port: &PortRef) -> anyhow::Result<Vec<Endpoint>> {
        let svc = self.store.get_service(svc_key)?;

        let mut upstreams: Vec<Endpoint> = Vec::new();
        tracing::debug!("Obtaining ports information for Service {}", svc_key);

        let bp = backend_port.to_string();
        for service_port in &svc.spec.ports {
            let target_matches = service_port
                .target_port
                .as_ref()
                .map(|t| t.to_string() == bp)
                .unwrap_or(false);
            if format!("{}", service_port.port) == bp || target_matches || service_port.name == bp {
                let endps = self.get_endpoints(&svc, service_port);
                if endps.is_empty() {
                    tracing::warn!("Service {} does not have any active Endpoint.", svc_key);
                }

                let mut endps = endps;
                if self.cfg.sort_backends {
                    endps.sort_by(|a, b| a.address.cmp(&b.address).then(a.port.cmp(&b.port)));
                }
                upstreams.extend(endps);
                break;
            }
        }

        // ExternalName services may omit ports entirely
        if svc.spec.ports.is_empty() && svc.spec.service_type == ServiceType::ExternalName {
            let external_port: u16 = match bp.parse() {
                Ok(port) => port,
                Err(_) => {
                    tracing::warn!(
                        "Only numeric ports are allowed in ExternalName Services: {} is not a valid port number.",
                        bp
                    );
                    return Ok(upstreams);
                },
            };

            let service_port = ServicePort {
                name: String::new(),
                port: external_port,
                target_port: Some(PortRef::Number(external_port)),
            };
            let endps = self.get_endpoints(&svc, &service_port);
            if endps.is_empty() {
                tracing::warn!("Service {} does not have any active Endpoint.", svc_key);
                return Ok(upstreams);
            }

            upstreams.extend(endps);
            return Ok(upstreams);
        }

        if !self.cfg.sort_backends {
            let mut rng = StdRng::seed_from_u64(self.shuffle_seed);
            upstreams.shuffle(&mut rng);
        }

        Ok(upstreams)
    }

    /// Expands one service port into `(address, port)` pairs, deduplicated.
    fn get_endpoints(&self, svc: &Service, port: &ServicePort) -> Vec<Endpoint> {
        let mut upstreams: Vec<Endpoint> = Vec::new();

        if svc.spec.service_type == ServiceType::ExternalName {
            let external = match &svc.spec.external_name {
                Some(name) if !name.is_empty() => name.clone(),
                _ => return upstreams,
            };
            let target = match &port.target_port {
                Some(PortRef::Number(n)) => *n,
                _ => port.port,
            };
            upstreams.push(Endpoint {
                address: external,
                port: format!("{}", target),
            });
            return upstreams;
        }

        let eps = match self.store.get_service_endpoints(&svc.metadata.key()) {
            Ok(eps) => eps,
            Err(e) => {
                tracing::warn!(
                    "Error obtaining Endpoints for Service {}: {:#}",
                    svc.metadata.key(),
                    e
                );
                return upstreams;
            },
        };

        let mut processed: HashSet<String> = HashSet::new();
        for subset in &eps.subsets {
            for ep_port in &subset.ports {
                if ep_port.protocol != Protocol::Tcp {
                    continue;
                }

                // an unnamed service port matches any endpoint port
                let target_port = if port.name.is_empty() {
                    ep_port.port
                } else if ep_port.name == port.name {
                    ep_port.port
                } else {
                    continue;
                };

                for address in &subset.addresses {
                    let key = format!("{}:{}", address.ip, target_port);
                    if !processed.insert(key) {
                        continue;
                    }
                    upstreams.push(Endpoint {
                        address: address.ip.clone(),
                        port: format!("{}", target_port),
                    });
                }
            }
        }

        upstreams
    }

    /// Builds the host → server map; every server starts with a root
    /// location routed to its ingress's default backend.
    fn create_servers(
        &self,
        ingresses: &[Ingress],
        upstreams: &HashMap<String, Backend>,
        du: &Backend,
    ) -> HashMap<String, Server> {
        let mut servers: HashMap<String, Server> = HashMap::new();
        let mut aliases: HashMap<String, String> = HashMap::new();

        let ngx_proxy = self.proxy_defaults();

        // generated at startup, used when no secret matches
        let mut default_pem_file_name = self.cfg.fake_certificate_path.clone();
        let mut default_pem_sha = self.cfg.fake_certificate_sha.clone();

        if let Ok(cert) = self
            .store
            .get_local_ssl_cert(&self.cfg.default_ssl_certificate)
        {
            default_pem_file_name = cert.pem_file_name;
            default_pem_sha = cert.pem_sha;
        }

        servers.insert(
            DEF_SERVER_NAME.to_string(),
            Server {
                hostname: DEF_SERVER_NAME.to_string(),
                ssl_cert: SSLCert {
                    pem_file_name: default_pem_file_name.clone(),
                    pem_sha: default_pem_sha.clone(),
                    ..Default::default()
                },
                locations: vec![Location {
                    path: ROOT_LOCATION.to_string(),
                    is_def_backend: true,
                    backend: du.name.clone(),
                    proxy: ngx_proxy.clone(),
                    service: du.service.clone(),
                    ..Default::default()
                }],
                ..Default::default()
            },
        );

        // initialize all other servers
        for ing in ingresses {
            let ing_key = ing.metadata.key();
            let anns = self.annotations(&ing_key);

            // default upstream for this ingress's rules
            let mut un = du.name.clone();

            if let Some(backend) = &ing.spec.backend {
                let def_upstream =
                    upstream_name(&ing.metadata.namespace, &backend.name, &backend.port);

                if let Some(backend_upstream) = upstreams.get(&def_upstream) {
                    un = backend_upstream.name.clone();

                    // catch-all case: a backend without rules replaces the
                    // default server's root location
                    let def_server = servers
                        .get_mut(DEF_SERVER_NAME)
                        .expect("default server exists");
                    let def_loc = &mut def_server.locations[0];
                    if def_loc.is_def_backend && ing.spec.rules.is_empty() {
                        tracing::info!(
                            "Ingress {} defines a backend but no rule. Using it to configure the catch-all server {}",
                            ing_key,
                            DEF_SERVER_NAME
                        );

                        def_loc.is_def_backend = false;
                        def_loc.backend = backend_upstream.name.clone();
                        def_loc.service = backend_upstream.service.clone();
                        def_loc.ingress = Some(ing_key.clone());

                        // redirect and rewrite can affect the catch-all
                        // behavior and are excluded here
                        let mut loc_anns = anns.clone();
                        loc_anns.redirect = Default::default();
                        loc_anns.rewrite = Default::default();
                        def_loc.annotations = loc_anns;
                        if anns.proxy != ProxyConfig::default() {
                            def_loc.proxy = anns.proxy.clone();
                        }
                    } else {
                        tracing::debug!(
                            "Ingress {} defines both a backend and rules. Using its backend as default upstream for all its rules.",
                            ing_key
                        );
                    }
                }
            }

            for rule in &ing.spec.rules {
                let host = normalize_host(&rule.host);
                if servers.contains_key(&host) {
                    continue;
                }

                servers.insert(
                    host.clone(),
                    Server {
                        hostname: host,
                        ssl_passthrough: anns.ssl_passthrough,
                        ssl_ciphers: anns.ssl_ciphers.clone(),
                        locations: vec![Location {
                            path: ROOT_LOCATION.to_string(),
                            is_def_backend: true,
                            backend: un.clone(),
                            proxy: ngx_proxy.clone(),
                            ..Default::default()
                        }],
                        ..Default::default()
                    },
                );
            }
        }

        // configure aliases, snippets, and SSL
        for ing in ingresses {
            let ing_key = ing.metadata.key();
            let anns = self.annotations(&ing_key);

            for rule in &ing.spec.rules {
                let host = normalize_host(&rule.host);
                let server = match servers.get_mut(&host) {
                    Some(server) => server,
                    None => continue,
                };

                if !anns.alias.is_empty() {
                    if server.alias.is_empty() {
                        server.alias = anns.alias.clone();
                        aliases
                            .entry(anns.alias.clone())
                            .or_insert_with(|| host.clone());
                    } else {
                        tracing::warn!(
                            "Aliases already configured for server {}, skipping (Ingress {})",
                            host,
                            ing_key
                        );
                    }
                }

                if !anns.server_snippet.is_empty() {
                    if server.server_snippet.is_empty() {
                        server.server_snippet = anns.server_snippet.clone();
                    } else {
                        tracing::warn!(
                            "Server snippet already configured for server {}, skipping (Ingress {})",
                            host,
                            ing_key
                        );
                    }
                }

                // only add SSL ciphers if they are not configured yet
                if server.ssl_ciphers.is_empty() && !anns.ssl_ciphers.is_empty() {
                    server.ssl_ciphers = anns.ssl_ciphers.clone();
                }

                // only add a certificate if the server has none yet
                if !server.ssl_cert.pem_file_name.is_empty() {
                    continue;
                }

                if ing.spec.tls.is_empty() {
                    tracing::debug!("Ingress {} does not contain a TLS section.", ing_key);
                    continue;
                }

                let tls_secret_name = self.extract_tls_secret_name(&host, ing);

                if tls_secret_name.is_empty() {
                    tracing::debug!(
                        "Host {} is listed in the TLS section but secretName is empty. Using default certificate.",
                        host
                    );
                    server.ssl_cert.pem_file_name = default_pem_file_name.clone();
                    server.ssl_cert.pem_sha = default_pem_sha.clone();
                    continue;
                }

                let secr_key = format!("{}/{}", ing.metadata.namespace, tls_secret_name);
                let mut cert = match self.store.get_local_ssl_cert(&secr_key) {
                    Ok(cert) => cert,
                    Err(e) => {
                        tracing::warn!(
                            "Error getting SSL certificate {}: {:#}. Using default certificate",
                            secr_key,
                            e
                        );
                        server.ssl_cert.pem_file_name = default_pem_file_name.clone();
                        server.ssl_cert.pem_sha = default_pem_sha.clone();
                        continue;
                    },
                };

                if !cert.matches_host(&host) {
                    tracing::warn!(
                        "SSL certificate {} does not contain a Common Name or Subject Alternative Name for server {}",
                        secr_key,
                        host
                    );
                    tracing::warn!("Using default certificate");
                    server.ssl_cert.pem_file_name = default_pem_file_name.clone();
                    server.ssl_cert.pem_sha = default_pem_sha.clone();
                    continue;
                }

                if let Some(expire_time) = cert.expire_time {
                    if expire_time < Utc::now() + Duration::hours(240) {
                        tracing::warn!(
                            "SSL certificate for server {} is about to expire ({})",
                            host,
                            expire_time
                        );
                    }
                }

                if self.cfg.dynamic_certificates_enabled {
                    // placeholders keep the configuration loader quiet, the
                    // real PEM travels over the dynamic channel
                    cert.pem_file_name = default_pem_file_name.clone();
                    cert.pem_sha = default_pem_sha.clone();
                }

                server.ssl_cert = cert;
            }
        }

        for (alias, host) in &aliases {
            if servers.contains_key(alias) {
                tracing::warn!(
                    "Conflicting hostname ({}) and alias ({}). Removing alias to avoid conflicts.",
                    host,
                    alias
                );
                if let Some(server) = servers.get_mut(host) {
                    server.alias.clear();
                }
            }
        }

        servers
    }

    /// The name of the secret carrying a certificate for `host`, resolved
    /// first by the declared TLS hosts and then by SAN/CN matching.
    fn extract_tls_secret_name(&self, host: &str, ing: &Ingress) -> String {
        // naively return the secret name when the host is declared
        for tls in &ing.spec.tls {
            if tls.hosts.iter().any(|h| h == host) {
                return tls.secret_name.clone();
            }
        }

        // no declared host matched, try each certificate's names
        for tls in &ing.spec.tls {
            if tls.secret_name.is_empty() {
                // there is no secretName to look up
                continue;
            }

            let secr_key = format!("{}/{}", ing.metadata.namespace, tls.secret_name);
            let cert = match self.store.get_local_ssl_cert(&secr_key) {
                Ok(cert) => cert,
                Err(e) => {
                    tracing::warn!("Error getting SSL certificate {}: {:#}", secr_key, e);
                    continue;
                },
            };

            if cert.matches_host(host) {
                tracing::debug!("Found SSL certificate matching host {}: {}", host, secr_key);
                return tls.secret_name.clone();
            }
        }

        String::new()
    }
}

fn fill_empty_policy(ups: &mut Backend, anns: &Annotations) {
    if ups.secure_ca_cert.secret.is_empty() {
        ups.secure_ca_cert = anns.secure_upstream.ca_cert.clone();
    }
    if ups.upstream_hash_by.is_empty() {
        ups.upstream_hash_by = anns.upstream_hash_by.clone();
    }
    if ups.load_balancing.is_empty() {
        ups.load_balancing = anns.load_balancing.clone();
    }
}

/// Attaches a canary ingress's upstreams to the matching non-canary
/// locations' backends; a canary with no match anywhere is dropped.
fn merge_alternative_backends(
    ing: &Ingress,
    upstreams: &mut HashMap<String, Backend>,
    servers: &mut HashMap<String, Server>,
) {
    // merge catch-all alternative backends
    if let Some(backend) = &ing.spec.backend {
        let ups_name = upstream_name(&ing.metadata.namespace, &backend.name, &backend.port);

        if upstreams.contains_key(&ups_name) {
            let def_backend = servers
                .get(DEF_SERVER_NAME)
                .map(|s| s.locations[0].backend.clone())
                .unwrap_or_default();

            if let Some(primary) = upstreams.get_mut(&def_backend) {
                tracing::info!(
                    "matching backend {} found for alternative backend {}",
                    primary.name,
                    ups_name
                );
                primary.alternative_backends.push(ups_name);
            }
        }
    }

    for rule in &ing.spec.rules {
        let host = normalize_host(&rule.host);
        for path in &rule.paths {
            let ups_name =
                upstream_name(&ing.metadata.namespace, &path.service.name, &path.service.port);
            let mut merged = false;

            let matching: Vec<String> = servers
                .get(&host)
                .map(|server| {
                    server
                        .locations
                        .iter()
                        .filter(|loc| loc.backend != DEF_UPSTREAM_NAME && loc.path == path.path)
                        .map(|loc| loc.backend.clone())
                        .collect()
                })
                .unwrap_or_default();

            for primary_name in matching {
                let primary_no_server = upstreams
                    .get(&primary_name)
                    .map(|u| u.no_server)
                    .unwrap_or(true);
                if primary_no_server {
                    continue;
                }

                tracing::info!(
                    "matching backend {} found for alternative backend {}",
                    primary_name,
                    ups_name
                );
                upstreams
                    .get_mut(&primary_name)
                    .expect("upstream exists")
                    .alternative_backends
                    .push(ups_name.clone());
                merged = true;
            }

            if !merged {
                tracing::warn!(
                    "unable to find real backend for alternative backend {}. Deleting.",
                    ups_name
                );
                upstreams.remove(&ups_name);
            }
        }
    }
}
