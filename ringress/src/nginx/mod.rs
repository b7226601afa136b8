//! The NGINX ingress controller: event loop, reconciliation, and process
//! supervision composed as one owned graph.

use std::{
    net::IpAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, RwLock as StdRwLock,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch, RwLock};

use crate::{
    config::ControllerConfig,
    errors::NginxError,
    model::{
        builder::ModelBuilder, is_dynamic_configuration_enough, removed_hosts, removed_ingresses,
        Configuration, SSLPassthroughBackend, ROOT_LOCATION,
    },
    nginx::{
        dynamic::{configure_dynamically, exponential_backoff, Backoff},
        passthrough::{accept_loop, TcpProxy, TcpServer},
        process::NginxProcess,
    },
    status::StatusSync,
    store::{Event, EventType, Storer},
    sync::{queue::Task, queue::TaskQueue, rate::RateLimiter, ring::RingReceiver},
    template::Template,
    watch as fswatch,
};

pub mod dynamic;
pub mod passthrough;
pub mod process;
mod reload;

pub use reload::{nginx_hash_bucket_size, next_power_of_2};

pub struct NginxController {
    pub cfg: ControllerConfig,
    store: Arc<dyn Storer>,
    sync_queue: Arc<TaskQueue>,
    sync_rate_limiter: RateLimiter,

    /// Last successfully applied model; single writer (the sync loop).
    running_config: RwLock<Configuration>,
    /// A failed patch after a successful reload is retried here without
    /// forcing another reload.
    pending_dynamic_patch: AtomicBool,

    template: StdRwLock<Template>,
    http_client: reqwest::Client,
    patch_backoff: Backoff,

    proxy: Arc<TcpProxy>,
    process: NginxProcess,

    resolver: Vec<IpAddr>,
    reload_count: AtomicU64,

    is_shutting_down: AtomicBool,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,

    status: Option<Arc<dyn StatusSync>>,
    shuffle_seed: u64,
}

impl NginxController {
    pub fn new(
        cfg: ControllerConfig,
        store: Arc<dyn Storer>,
        status: Option<Arc<dyn StatusSync>>,
    ) -> Result<Arc<Self>> {
        let template = Template::new(&cfg.template_path)
            .context("Invalid NGINX configuration template")?;

        let resolver = read_system_nameservers();
        if resolver.is_empty() {
            tracing::warn!("Error reading system nameservers");
        }

        let (stop_tx, stop_rx) = watch::channel(false);

        let proxy = if cfg.enable_ssl_passthrough {
            Arc::new(TcpProxy::new(Some(TcpServer {
                hostname: "localhost".to_string(),
                ip: "127.0.0.1".to_string(),
                port: cfg.listen_ports.ssl_proxy,
                proxy_protocol: true,
            })))
        } else {
            Arc::new(TcpProxy::new(None))
        };

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build admin HTTP client")?;

        let process = NginxProcess::new(&cfg.nginx_binary);
        let sync_queue = Arc::new(TaskQueue::new());
        let sync_rate_limiter = RateLimiter::new(cfg.sync_rate_limit);

        let controller = Arc::new(Self {
            process,
            sync_rate_limiter,
            running_config: RwLock::new(Configuration::default()),
            pending_dynamic_patch: AtomicBool::new(false),
            template: StdRwLock::new(template),
            http_client,
            patch_backoff: Backoff::default(),
            proxy,
            resolver,
            reload_count: AtomicU64::new(0),
            is_shutting_down: AtomicBool::new(false),
            stop_tx,
            stop_rx,
            status,
            shuffle_seed: rand::random(),
            sync_queue,
            store,
            cfg,
        });

        Ok(controller)
    }

    /// Watches the template file and the geoip data files; any change
    /// enqueues a dummy task so the next reconciliation re-renders.
    pub fn setup_file_watchers(self: &Arc<Self>) -> Vec<fswatch::FileWatcher> {
        let mut watchers = Vec::new();

        let template_path = self.cfg.template_path.clone();
        let controller = self.clone();
        match fswatch::watch_paths(&[template_path.clone()], move |_| {
            controller.on_template_change();
        }) {
            Ok(w) => watchers.push(w),
            Err(e) => tracing::warn!(
                "Error creating file watcher for {}: {:#}",
                template_path.display(),
                e
            ),
        }

        let geoip_files = fswatch::files_under(&self.cfg.geoip_path);
        if !geoip_files.is_empty() {
            let queue = self.sync_queue.clone();
            match fswatch::watch_paths(&geoip_files, move |path| {
                tracing::info!("File {} changed. Reloading NGINX", path.display());
                queue.enqueue("file-change");
            }) {
                Ok(w) => watchers.push(w),
                Err(e) => tracing::warn!("Error creating file watchers: {:#}", e),
            }
        }

        watchers
    }

    fn on_template_change(&self) {
        match Template::new(&self.cfg.template_path) {
            Ok(template) => {
                *self.template.write().expect("template lock poisoned") = template;
                tracing::info!("New NGINX configuration template loaded.");
                self.sync_queue.enqueue("template-change");
            },
            Err(e) => {
                // this error is different from the rest because it must be
                // clear why nginx is not working
                tracing::error!(
                    "\n-------------------------------------------------------------------------------\nError loading new template: {}\n-------------------------------------------------------------------------------",
                    e
                );
            },
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    pub fn reloads(&self) -> u64 {
        self.reload_count.load(Ordering::SeqCst)
    }

    pub fn stop_channel(&self) -> watch::Receiver<bool> {
        self.stop_rx.clone()
    }

    /// Runs the controller: store informers, queue consumer, NGINX master
    /// process, and the central select loop.
    pub async fn start(self: Arc<Self>, mut update_rx: RingReceiver<Event>) -> Result<()> {
        tracing::info!("Starting NGINX Ingress controller");

        self.store.run(self.stop_rx.clone());

        if let Some(status) = &self.status {
            status.run();
        } else if self.cfg.update_status {
            tracing::warn!("Update of Ingress status requested but no status publisher is wired");
        }

        if self.cfg.enable_ssl_passthrough {
            self.setup_ssl_proxy().await?;
        }

        tracing::info!("Starting NGINX process");
        let (ngx_err_tx, mut ngx_err_rx) = mpsc::channel(1);
        self.process.start(ngx_err_tx.clone())?;

        // the single consumer of the work queue
        {
            let queue = self.sync_queue.clone();
            let stop = self.stop_rx.clone();
            let controller = self.clone();
            tokio::spawn(async move {
                queue
                    .run(Duration::from_secs(1), stop, move |task| {
                        let controller = controller.clone();
                        async move { controller.sync(task).await }
                    })
                    .await;
            });
        }

        // force initial sync
        self.sync_queue.enqueue("initial-sync");

        let mut stop_rx = self.stop_rx.clone();
        loop {
            tokio::select! {
                Some(exit) = ngx_err_rx.recv() => {
                    if self.is_shutting_down() {
                        continue;
                    }

                    // if the master process dies the workers keep serving,
                    // but reloads would be lost; restart it
                    if process::is_respawn_if_required(&exit) {
                        tracing::warn!("NGINX process died: {:?}. Respawning.", exit);
                        process::wait_until_port_is_available(self.cfg.listen_ports.http).await;
                        self.process.start(ngx_err_tx.clone())?;
                    }
                },
                event = update_rx.recv() => {
                    if self.is_shutting_down() {
                        continue;
                    }

                    tracing::debug!("Event {:?} received - object {}", event.event_type, event.obj);
                    match event.event_type {
                        EventType::Configuration => self.sync_queue.enqueue("configmap-change"),
                        _ => self.sync_queue.enqueue_skippable(&event.obj),
                    }
                },
                _ = stop_rx.changed() => break,
            }
        }

        Ok(())
    }

    async fn setup_ssl_proxy(self: &Arc<Self>) -> Result<()> {
        let ssl_port = self.cfg.listen_ports.https;

        tracing::info!("Starting TLS proxy for SSL Passthrough");
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", ssl_port))
            .await
            .with_context(|| format!("failed to listen on port {}", ssl_port))?;

        let proxy = self.proxy.clone();
        let stop = self.stop_rx.clone();
        tokio::spawn(accept_loop(listener, proxy, stop));
        Ok(())
    }

    /// Gracefully stops the controller and the NGINX master process.
    /// Concurrent calls are serialized; the second one fails fast.
    pub async fn stop(&self) -> Result<(), NginxError> {
        if self.is_shutting_down.swap(true, Ordering::SeqCst) {
            return Err(NginxError::ShutdownInProgress);
        }

        tracing::info!("Shutting down controller queues");
        let _ = self.stop_tx.send(true);
        self.sync_queue.shutdown();
        if let Some(status) = &self.status {
            status.shutdown();
        }

        tracing::info!("Stopping NGINX process");
        self.process.quit_and_wait(Duration::from_secs(300)).await
    }

    /// One reconciliation: build, diff, reload and/or patch, commit.
    pub async fn sync(self: &Arc<Self>, _task: Task) -> Result<()> {
        self.sync_rate_limiter.accept().await;

        if self.sync_queue.is_shutting_down() {
            return Ok(());
        }

        // sort Ingresses using the resource version field
        let mut ings = self.store.list_ingresses();
        ings.sort_by(|a, b| {
            a.metadata
                .resource_version
                .cmp(&b.metadata.resource_version)
        });

        let builder = ModelBuilder::new(self.store.as_ref(), &self.cfg, self.shuffle_seed);
        let (upstreams, servers) = builder.get_backend_servers(&ings);

        let mut pass_upstreams: Vec<SSLPassthroughBackend> = Vec::new();
        for server in &servers {
            if !server.ssl_passthrough {
                continue;
            }

            for loc in &server.locations {
                if loc.path != ROOT_LOCATION {
                    tracing::warn!(
                        "Ignoring SSL Passthrough for location {} in server {}",
                        loc.path,
                        server.hostname
                    );
                    continue;
                }
                pass_upstreams.push(SSLPassthroughBackend {
                    backend: loc.backend.clone(),
                    hostname: server.hostname.clone(),
                    service: loc.service.clone(),
                    port: loc.port.clone(),
                });
                break;
            }
        }

        let mut pcfg = Configuration {
            backends: upstreams,
            servers,
            passthrough_backends: pass_upstreams,
            backend_config_checksum: self.store.get_backend_configuration().checksum,
            configuration_checksum: String::new(),
        };

        let (is_equal, dynamic_enough) = {
            let running = self.running_config.read().await;
            (
                running.equal(&pcfg),
                is_dynamic_configuration_enough(
                    &running,
                    &pcfg,
                    self.cfg.dynamic_certificates_enabled,
                ),
            )
        };

        if is_equal && !self.pending_dynamic_patch.load(Ordering::SeqCst) {
            tracing::debug!("No configuration change detected, skipping backend reload.");
            return Ok(());
        }

        let mut reloaded = false;
        if !dynamic_enough {
            tracing::info!("Configuration changes detected, backend reload required.");

            pcfg.configuration_checksum = pcfg.checksum()?;

            if let Err(e) = self.on_update(&pcfg).await {
                tracing::error!("Unexpected failure reloading the backend:\n{:#}", e);
                return Err(e.into());
            }

            self.reload_count.fetch_add(1, Ordering::SeqCst);
            tracing::info!("Backend successfully reloaded.");
            reloaded = true;
        }

        // endpoints and certificates always travel the dynamic channel
        let patch = exponential_backoff(self.patch_backoff, || {
            configure_dynamically(
                &self.http_client,
                &pcfg,
                self.cfg.listen_ports.status,
                self.cfg.dynamic_certificates_enabled,
            )
        })
        .await;

        if let Err(e) = patch {
            tracing::error!("Unexpected failure reconfiguring NGINX:\n{:#}", e);
            if reloaded {
                // the reloaded state is live; keep it so the retry only
                // repeats the patch
                *self.running_config.write().await = pcfg;
                self.pending_dynamic_patch.store(true, Ordering::SeqCst);
            }
            return Err(e.into());
        }
        self.pending_dynamic_patch.store(false, Ordering::SeqCst);

        {
            let running = self.running_config.read().await;
            let gone_ingresses = removed_ingresses(&running, &pcfg);
            let gone_hosts = removed_hosts(&running, &pcfg);
            if !gone_ingresses.is_empty() {
                tracing::debug!("Ingresses removed from the configuration: {:?}", gone_ingresses);
            }
            if !gone_hosts.is_empty() {
                tracing::debug!("Hosts removed from the configuration: {:?}", gone_hosts);
            }
        }

        *self.running_config.write().await = pcfg;

        Ok(())
    }
}

/// Nameservers used for the rendered `resolver` directives.
fn read_system_nameservers() -> Vec<IpAddr> {
    read_nameservers_from(&PathBuf::from("/etc/resolv.conf"))
}

fn read_nameservers_from(path: &PathBuf) -> Vec<IpAddr> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(_) => return Vec::new(),
    };

    content
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("nameserver") => parts.next().and_then(|ip| ip.parse().ok()),
                _ => None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        sync::mpsc::{unbounded_channel, UnboundedReceiver},
    };

    use resources::{
        annotations::Annotations,
        objects::{
            endpoints::{EndpointAddress, EndpointPort, Endpoints, EndpointSubset, Protocol},
            ingress::{Ingress, IngressPath, IngressRule, IngressService, IngressSpec, PortRef},
            service::{Service, ServicePort, ServiceSpec},
            Metadata,
        },
    };

    use crate::{
        store::test_support::MockStore,
        template::TEST_TEMPLATE,
    };

    use super::*;

    /// Minimal admin endpoint answering 201 to every POST and recording
    /// the request paths.
    async fn spawn_admin_stub() -> (u16, UnboundedReceiver<String>) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = unbounded_channel();

        tokio::spawn(async move {
            loop {
                let (mut conn, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut buf: Vec<u8> = Vec::new();
                    let mut chunk = [0u8; 4096];
                    let body_start = loop {
                        match conn.read(&mut chunk).await {
                            Ok(0) => return,
                            Ok(n) => {
                                buf.extend_from_slice(&chunk[..n]);
                                if let Some(pos) =
                                    buf.windows(4).position(|w| w == b"\r\n\r\n")
                                {
                                    break pos + 4;
                                }
                            },
                            Err(_) => return,
                        }
                    };

                    let head = String::from_utf8_lossy(&buf[..body_start]).to_string();
                    let content_length: usize = head
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            if name.eq_ignore_ascii_case("content-length") {
                                value.trim().parse().ok()
                            } else {
                                None
                            }
                        })
                        .unwrap_or(0);

                    while buf.len() < body_start + content_length {
                        match conn.read(&mut chunk).await {
                            Ok(0) => break,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                            Err(_) => return,
                        }
                    }

                    if let Some(path) = head.lines().next().and_then(|l| l.split(' ').nth(1)) {
                        let _ = tx.send(path.to_string());
                    }
                    let _ = conn
                        .write_all(b"HTTP/1.1 201 Created\r\ncontent-length: 0\r\n\r\n")
                        .await;
                });
            }
        });

        (port, rx)
    }

    async fn test_controller(
        store: Arc<MockStore>,
    ) -> (Arc<NginxController>, tempfile::TempDir, UnboundedReceiver<String>) {
        let (status_port, posts) = spawn_admin_stub().await;

        let dir = tempfile::tempdir().unwrap();
        let template_path = dir.path().join("nginx.tmpl");
        std::fs::write(&template_path, TEST_TEMPLATE).unwrap();

        let cfg = ControllerConfig {
            sort_backends: true,
            sync_rate_limit: 0.0,
            nginx_binary: "true".to_string(),
            cfg_path: dir.path().join("nginx.conf"),
            template_path,
            geoip_path: dir.path().join("geoip"),
            opentracing_cfg_path: dir.path().join("opentracing.json"),
            listen_ports: crate::config::ListenPorts {
                status: status_port,
                ..Default::default()
            },
            ..Default::default()
        };

        let mut controller = NginxController::new(cfg, store, None).unwrap();
        {
            let c = Arc::get_mut(&mut controller).unwrap();
            c.patch_backoff = Backoff {
                steps: 2,
                duration: Duration::from_millis(1),
                factor: 0.8,
                jitter: 0.1,
            };
            c.shuffle_seed = 0;
        }

        (controller, dir, posts)
    }

    fn task() -> Task {
        Task {
            key: "test-sync".to_string(),
            skippable: false,
        }
    }

    fn metadata(namespace: &str, name: &str, rv: &str) -> Metadata {
        Metadata {
            name: name.to_string(),
            namespace: namespace.to_string(),
            resource_version: rv.to_string(),
            ..Default::default()
        }
    }

    fn add_app(store: &MockStore, host: &str, svc: &str, ips: &[&str]) {
        let key = format!("ns/{}", svc);
        store.add_service(
            &key,
            Service {
                metadata: metadata("ns", svc, "1"),
                spec: ServiceSpec {
                    ports: vec![ServicePort {
                        name: String::new(),
                        port: 80,
                        target_port: Some(PortRef::Number(80)),
                    }],
                    cluster_ip: Some("10.96.0.20".to_string()),
                    ..Default::default()
                },
            },
        );
        set_endpoints(store, svc, ips);
        store.add_ingress(Ingress {
            metadata: metadata("ns", &format!("{}-ing", svc), "1"),
            spec: IngressSpec {
                backend: None,
                rules: vec![IngressRule {
                    host: Some(host.to_string()),
                    paths: vec![IngressPath {
                        path: "/".to_string(),
                        service: IngressService {
                            name: svc.to_string(),
                            port: PortRef::Number(80),
                        },
                    }],
                }],
                tls: Vec::new(),
            },
        });
    }

    fn set_endpoints(store: &MockStore, svc: &str, ips: &[&str]) {
        store.add_endpoints(
            &format!("ns/{}", svc),
            Endpoints {
                metadata: metadata("ns", svc, "1"),
                subsets: vec![EndpointSubset {
                    addresses: ips
                        .iter()
                        .map(|ip| EndpointAddress {
                            ip: ip.to_string(),
                        })
                        .collect(),
                    ports: vec![EndpointPort {
                        name: String::new(),
                        port: 80,
                        protocol: Protocol::Tcp,
                    }],
                }],
            },
        );
    }

    #[tokio::test]
    async fn empty_cluster_reloads_once_on_startup() {
        let store = Arc::new(MockStore::default());
        let (controller, _dir, _posts) = test_controller(store).await;

        controller.sync(task()).await.unwrap();
        assert_eq!(controller.reloads(), 1);

        {
            let running = controller.running_config.read().await;
            assert_eq!(running.servers.len(), 1);
            assert_eq!(running.servers[0].hostname, crate::model::DEF_SERVER_NAME);
            assert_eq!(running.backends.len(), 1);
            assert_eq!(running.backends[0].name, crate::model::DEF_UPSTREAM_NAME);
        }

        controller.sync(task()).await.unwrap();
        assert_eq!(controller.reloads(), 1);
    }

    #[tokio::test]
    async fn repeated_sync_reloads_once() {
        let store = Arc::new(MockStore::default());
        add_app(&store, "a.example.com", "svc", &["10.0.0.1"]);

        let (controller, _dir, _posts) = test_controller(store).await;

        controller.sync(task()).await.unwrap();
        assert_eq!(controller.reloads(), 1);
        assert!(controller.cfg.cfg_path.exists());

        // an identical snapshot is a no-op
        controller.sync(task()).await.unwrap();
        assert_eq!(controller.reloads(), 1);
    }

    #[tokio::test]
    async fn endpoint_churn_skips_reload_and_patches_dynamically() {
        let store = Arc::new(MockStore::default());
        add_app(&store, "a.example.com", "svc", &["10.0.0.1"]);

        let (controller, _dir, mut posts) = test_controller(store.clone()).await;

        controller.sync(task()).await.unwrap();
        assert_eq!(controller.reloads(), 1);
        assert_eq!(posts.recv().await.unwrap(), "/configuration/backends");

        set_endpoints(&store, "svc", &["10.0.0.2", "10.0.0.3"]);
        controller.sync(task()).await.unwrap();

        // endpoints travel the dynamic channel, no second reload
        assert_eq!(controller.reloads(), 1);
        assert_eq!(posts.recv().await.unwrap(), "/configuration/backends");

        let running = controller.running_config.read().await;
        let backend = running
            .backends
            .iter()
            .find(|b| b.name == "ns-svc-80")
            .unwrap();
        assert_eq!(backend.endpoints.len(), 2);
    }

    #[tokio::test]
    async fn server_set_change_forces_reload() {
        let store = Arc::new(MockStore::default());
        add_app(&store, "a.example.com", "svc", &["10.0.0.1"]);

        let (controller, _dir, _posts) = test_controller(store.clone()).await;
        controller.sync(task()).await.unwrap();
        assert_eq!(controller.reloads(), 1);

        add_app(&store, "b.example.com", "other", &["10.0.0.9"]);
        controller.sync(task()).await.unwrap();
        assert_eq!(controller.reloads(), 2);
    }

    #[tokio::test]
    async fn configmap_checksum_change_forces_reload() {
        let store = Arc::new(MockStore::default());
        add_app(&store, "a.example.com", "svc", &["10.0.0.1"]);

        let (controller, _dir, _posts) = test_controller(store.clone()).await;
        controller.sync(task()).await.unwrap();
        assert_eq!(controller.reloads(), 1);

        store.backend_config.write().unwrap().checksum = "new-configmap".to_string();
        controller.sync(task()).await.unwrap();
        assert_eq!(controller.reloads(), 2);
    }

    #[tokio::test]
    async fn passthrough_keeps_only_root_locations() {
        let store = Arc::new(MockStore::default());
        add_app(&store, "tls.example.com", "svc", &["10.0.0.1"]);
        store.add_annotations(
            "ns/svc-ing",
            Annotations {
                ssl_passthrough: true,
                ..Default::default()
            },
        );
        {
            // add a second, non-root path to the same host
            let mut ings = store.ingresses.write().unwrap();
            ings[0].spec.rules[0].paths.push(IngressPath {
                path: "/admin".to_string(),
                service: IngressService {
                    name: "svc".to_string(),
                    port: PortRef::Number(80),
                },
            });
        }

        let (controller, _dir, _posts) = test_controller(store).await;
        controller.sync(task()).await.unwrap();

        let running = controller.running_config.read().await;
        assert_eq!(running.passthrough_backends.len(), 1);
        assert_eq!(running.passthrough_backends[0].hostname, "tls.example.com");
        assert_eq!(running.passthrough_backends[0].backend, "ns-svc-80");
    }

    #[tokio::test]
    async fn failed_patch_after_reload_keeps_reloaded_state() {
        let store = Arc::new(MockStore::default());
        add_app(&store, "a.example.com", "svc", &["10.0.0.1"]);

        let (mut controller, _dir, _posts) = {
            let (c, d, p) = test_controller(store.clone()).await;
            (c, d, p)
        };
        // point the patch at a dead port
        {
            let c = Arc::get_mut(&mut controller).unwrap();
            c.cfg.listen_ports.status = 1;
        }

        assert!(controller.sync(task()).await.is_err());
        assert_eq!(controller.reloads(), 1);

        // the reload took, only the patch is pending
        assert!(controller.pending_dynamic_patch.load(Ordering::SeqCst));
        let running = controller.running_config.read().await;
        assert!(!running.servers.is_empty());
    }

    #[tokio::test]
    async fn stop_is_serialized() {
        let store = Arc::new(MockStore::default());
        let (controller, _dir, _posts) = test_controller(store).await;

        controller.stop().await.unwrap();
        let second = controller.stop().await.unwrap_err();
        assert!(matches!(second, NginxError::ShutdownInProgress));
        assert!(controller.sync_queue.is_shutting_down());
    }

    #[tokio::test]
    async fn template_change_reloads_template_and_enqueues_task() {
        let store = Arc::new(MockStore::default());
        let (controller, dir, _posts) = test_controller(store).await;

        std::fs::write(
            dir.path().join("nginx.tmpl"),
            format!("{}\n# updated", TEST_TEMPLATE),
        )
        .unwrap();
        controller.on_template_change();
        assert_eq!(controller.sync_queue.len(), 1);

        // a broken template keeps the last good one and enqueues nothing
        std::fs::write(dir.path().join("nginx.tmpl"), "broken").unwrap();
        controller.on_template_change();
        assert_eq!(controller.sync_queue.len(), 1);
    }

    #[test]
    fn nameserver_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        std::fs::write(&path, "# comment\nnameserver 10.0.0.2\nnameserver ::1\nsearch local\n")
            .unwrap();

        let servers = read_nameservers_from(&path);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0], "10.0.0.2".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn dh_param_secret_is_written_next_to_the_config() {
        use resources::objects::secret::Secret;

        let store = Arc::new(MockStore::default());
        add_app(&store, "a.example.com", "svc", &["10.0.0.1"]);
        store.secrets.write().unwrap().insert(
            "ns/dhparam".to_string(),
            Secret {
                metadata: metadata("ns", "dhparam", "1"),
                data: HashMap::from([(
                    "dhparam.pem".to_string(),
                    b"dh-bytes".to_vec(),
                )]),
            },
        );
        store.backend_config.write().unwrap().ssl_dh_param = "ns/dhparam".to_string();

        let (controller, dir, _posts) = test_controller(store).await;
        controller.sync(task()).await.unwrap();

        let pem = dir.path().join("ns-dhparam.pem");
        assert_eq!(std::fs::read(pem).unwrap(), b"dh-bytes");
    }
}
