#[macro_use]
extern crate lazy_static;

use std::{env, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use reqwest::Url;

use ringress::{
    config::{ControllerConfig, ListenPorts},
    nginx::NginxController,
    status::StatusConfig,
    store::cluster::ClusterStore,
    sync::ring::ring_channel,
};

lazy_static! {
    static ref API_SERVER: Url = {
        dotenv::from_path("/etc/ringress/node.env").ok();
        match env::var("API_SERVER_ENDPOINT") {
            Ok(url) => Url::parse(url.as_str()).unwrap(),
            Err(_) => Url::parse("http://127.0.0.1:8080/").unwrap(),
        }
    };
}

#[derive(Parser)]
#[clap(author, version, about = "NGINX ingress controller", long_about = None)]
struct Cli {
    /// Namespace to watch; all namespaces when empty
    #[clap(long, default_value = "")]
    watch_namespace: String,
    /// `namespace/name` of the configmap carrying the runtime configuration
    #[clap(long, default_value = "")]
    configmap: String,
    /// `namespace/name` of the service backing `upstream-default-backend`
    #[clap(long, default_value = "")]
    default_backend_service: String,
    /// `namespace/name` of the secret with the fallback certificate
    #[clap(long, default_value = "")]
    default_ssl_certificate: String,
    #[clap(long, default_value = "")]
    publish_service: String,
    #[clap(long, default_value = "")]
    publish_status_address: String,
    #[clap(long)]
    update_status: bool,
    #[clap(long)]
    no_update_status_on_shutdown: bool,
    #[clap(long)]
    use_node_internal_ip: bool,
    #[clap(long, default_value = "ingress-controller-leader")]
    election_id: String,
    /// Emit endpoints in lexicographic order instead of shuffling
    #[clap(long)]
    sort_backends: bool,
    /// Reconciliations admitted per second
    #[clap(long, default_value_t = 0.3)]
    sync_rate_limit: f32,
    /// Full resync interval in seconds
    #[clap(long, default_value_t = 600)]
    sync_period: u64,
    #[clap(long)]
    enable_ssl_passthrough: bool,
    #[clap(long)]
    enable_ssl_chain_completion: bool,
    #[clap(long)]
    enable_dynamic_certificates: bool,
    #[clap(long, default_value_t = 80)]
    http_port: u16,
    #[clap(long, default_value_t = 443)]
    https_port: u16,
    #[clap(long, default_value_t = 18080)]
    status_port: u16,
    #[clap(long, default_value_t = 442)]
    ssl_passthrough_proxy_port: u16,
    #[clap(long, default_value_t = 8181)]
    default_server_port: u16,
    #[clap(long, default_value = "nginx")]
    nginx_binary: String,
    #[clap(long, default_value = "/etc/nginx/template/nginx.tmpl")]
    template_path: PathBuf,
}

impl Cli {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            resync_period: Duration::from_secs(self.sync_period),
            namespace: self.watch_namespace.clone(),
            config_map_name: self.configmap.clone(),
            default_service: self.default_backend_service.clone(),
            default_ssl_certificate: self.default_ssl_certificate.clone(),
            publish_service: self.publish_service.clone(),
            publish_status_address: self.publish_status_address.clone(),
            update_status: self.update_status,
            update_status_on_shutdown: !self.no_update_status_on_shutdown,
            use_node_internal_ip: self.use_node_internal_ip,
            election_id: self.election_id.clone(),
            sort_backends: self.sort_backends,
            sync_rate_limit: self.sync_rate_limit,
            listen_ports: ListenPorts {
                http: self.http_port,
                https: self.https_port,
                status: self.status_port,
                ssl_proxy: self.ssl_passthrough_proxy_port,
                default: self.default_server_port,
            },
            enable_ssl_passthrough: self.enable_ssl_passthrough,
            enable_ssl_chain_completion: self.enable_ssl_chain_completion,
            dynamic_certificates_enabled: self.enable_dynamic_certificates,
            nginx_binary: self.nginx_binary.clone(),
            template_path: self.template_path.clone(),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let cfg = cli.controller_config();

    if cfg.update_status {
        let status_cfg = StatusConfig::from_controller(&cfg);
        tracing::info!(
            "Status publishing delegated to the external status syncer: {:?}",
            status_cfg
        );
    } else {
        tracing::warn!("Update of Ingress status is disabled (flag --update-status)");
    }

    let (update_tx, update_rx) = ring_channel(1024);
    let store = Arc::new(ClusterStore::new(
        API_SERVER.clone(),
        &cfg.namespace,
        &cfg.config_map_name,
        cfg.resync_period,
        update_tx,
    ));

    let controller = NginxController::new(cfg, store, None)?;
    let _watchers = controller.setup_file_watchers();

    {
        let controller = controller.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Received shutdown signal");
            if let Err(e) = controller.stop().await {
                tracing::error!("Error during shutdown: {:#}", e);
            }
        });
    }

    controller.start(update_rx).await
}
