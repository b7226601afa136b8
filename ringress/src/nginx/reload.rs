//! Full reload of the data plane: merge runtime configuration, render,
//! validate out-of-process, atomically replace the live file, and signal
//! the master process.

use std::{collections::HashMap, io::Write};

use tokio::process::Command;

use crate::{
    errors::NginxError,
    model::Configuration,
    nginx::{passthrough::TcpServer, NginxController},
    template::{opentracing_cfg, TemplateConfig},
};

use resources::objects::ingress::PortRef;

const HEALTHZ_PATH: &str = "/healthz";

impl NginxController {
    /// Called whenever a reload is required. The model is merged with the
    /// configmap-derived runtime configuration before rendering.
    pub(crate) async fn on_update(&self, ingress_cfg: &Configuration) -> Result<(), NginxError> {
        let mut cfg = self.store.get_backend_configuration();
        cfg.resolver = self.resolver.clone();

        if self.cfg.enable_ssl_passthrough {
            self.proxy
                .update_servers(self.passthrough_servers(ingress_cfg));
        }

        // NGINX cannot resize the server-name hash tables at runtime, so
        // derive sizes that fit the configured hostnames
        let mut longest_name = 0;
        let mut server_name_bytes = 0;
        let mut redirect_servers: HashMap<String, String> = HashMap::new();
        for srv in &ingress_cfg.servers {
            if longest_name < srv.hostname.len() {
                longest_name = srv.hostname.len();
            }
            server_name_bytes += srv.hostname.len();

            if srv.redirect_from_to_www {
                let target = match srv.hostname.strip_prefix("www.") {
                    Some(base) => base.to_string(),
                    None => format!("www.{}", srv.hostname),
                };
                tracing::debug!("Creating redirect from {} to {}", srv.hostname, target);
                let exists = ingress_cfg.servers.iter().any(|s| s.hostname == target);
                if !exists && !redirect_servers.contains_key(&target) {
                    redirect_servers.insert(target, srv.hostname.clone());
                }
            }
        }

        if cfg.server_name_hash_bucket_size == 0 {
            let bucket_size = nginx_hash_bucket_size(longest_name);
            tracing::debug!("Adjusting ServerNameHashBucketSize variable to {}", bucket_size);
            cfg.server_name_hash_bucket_size = bucket_size;
        }
        let hash_max_size = next_power_of_2(server_name_bytes);
        if cfg.server_name_hash_max_size < hash_max_size {
            tracing::debug!("Adjusting ServerNameHashMaxSize variable to {}", hash_max_size);
            cfg.server_name_hash_max_size = hash_max_size;
        }

        // the open-file limit is per worker, leave headroom
        let workers: i64 = cfg.worker_processes.parse().unwrap_or(1);
        let mut max_open_files = (sysctl_fs_file_max() / workers) - 1024;
        tracing::debug!("Maximum number of open file descriptors: {}", max_open_files);
        if max_open_files < 1024 {
            // the machine's RLIMIT_NOFILE is too low
            max_open_files = 1024;
        }

        let set_headers = self.header_config_map(&cfg.proxy_set_headers);
        let add_headers = self.header_config_map(&cfg.add_headers);

        cfg.ssl_dh_param = self.write_dh_param(&cfg.ssl_dh_param);

        let custom_errors = !cfg.custom_http_errors.is_empty();
        cfg.checksum = ingress_cfg.configuration_checksum.clone();

        let enable_opentracing = cfg.enable_opentracing;
        let tc = TemplateConfig {
            proxy_set_headers: set_headers,
            add_headers,
            max_open_files,
            backlog_size: sysctl_somaxconn(),
            backends: ingress_cfg.backends.clone(),
            passthrough_backends: ingress_cfg.passthrough_backends.clone(),
            servers: ingress_cfg.servers.clone(),
            healthz_uri: HEALTHZ_PATH.to_string(),
            custom_errors,
            cfg,
            is_ipv6_enabled: false,
            redirect_servers,
            is_ssl_passthrough_enabled: self.cfg.enable_ssl_passthrough,
            listen_ports: self.cfg.listen_ports,
            publish_service: self.get_publish_service(),
            dynamic_certificates_enabled: self.cfg.dynamic_certificates_enabled,
        };

        let content = {
            let template = self.template.read().expect("template lock poisoned");
            template.write(&tc)?
        };

        if enable_opentracing {
            write_owner_rw(
                &self.cfg.opentracing_cfg_path,
                opentracing_cfg(&tc.cfg).as_bytes(),
            )?;
        }

        self.test_template(&content).await?;
        self.log_configuration_diff(&content);

        write_owner_rw(&self.cfg.cfg_path, &content)?;

        let output = Command::new(&self.cfg.nginx_binary)
            .args(["-s", "reload"])
            .output()
            .await
            .map_err(|e| NginxError::ReloadFailed {
                output: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(NginxError::ReloadFailed {
                output: format!(
                    "{}\n{}{}",
                    output.status,
                    String::from_utf8_lossy(&output.stdout),
                    String::from_utf8_lossy(&output.stderr)
                ),
            });
        }

        Ok(())
    }

    /// The Service used to publish load-balancer addresses, when any.
    fn get_publish_service(&self) -> Option<resources::objects::service::Service> {
        if self.cfg.publish_service.is_empty() {
            return None;
        }
        self.store.get_service(&self.cfg.publish_service).ok()
    }

    fn passthrough_servers(&self, ingress_cfg: &Configuration) -> Vec<TcpServer> {
        let mut servers = Vec::new();

        for pb in &ingress_cfg.passthrough_backends {
            let svc = match &pb.service {
                Some(svc) => svc,
                None => {
                    tracing::warn!("Missing Service for SSL Passthrough backend {}", pb.backend);
                    continue;
                },
            };

            let port = match &pb.port {
                PortRef::Number(n) => svc
                    .spec
                    .ports
                    .iter()
                    .find(|sp| sp.port == *n)
                    .map(|sp| sp.port)
                    .unwrap_or(*n),
                PortRef::Name(name) => match svc.lookup_port(name) {
                    Some(port) => port,
                    None => continue,
                },
            };

            let ip = match &svc.spec.cluster_ip {
                Some(ip) if !ip.is_empty() => ip.clone(),
                _ => continue,
            };

            servers.push(TcpServer {
                hostname: pb.hostname.clone(),
                ip,
                port,
                proxy_protocol: false,
            });
        }

        servers
    }

    fn header_config_map(&self, key: &str) -> HashMap<String, String> {
        if key.is_empty() {
            return HashMap::new();
        }
        match self.store.get_config_map(key) {
            Ok(cm) => cm.data,
            Err(e) => {
                tracing::warn!("Error reading ConfigMap {} from local store: {:#}", key, e);
                HashMap::new()
            },
        }
    }

    /// Resolves the DH parameters secret to a file next to the live
    /// configuration; returns the file path or an empty string.
    fn write_dh_param(&self, secret_name: &str) -> String {
        if secret_name.is_empty() {
            return String::new();
        }

        let secret = match self.store.get_secret(secret_name) {
            Ok(secret) => secret,
            Err(e) => {
                tracing::warn!(
                    "Error reading Secret {} from local store: {:#}",
                    secret_name,
                    e
                );
                return String::new();
            },
        };

        let dh = match secret.data.get("dhparam.pem") {
            Some(dh) => dh,
            None => return String::new(),
        };

        let ns_sec_name = secret_name.replace('/', "-");
        let pem_path = self.cfg.cfg_path.with_file_name(format!("{}.pem", ns_sec_name));
        match write_owner_rw(&pem_path, dh) {
            Ok(()) => pem_path.display().to_string(),
            Err(e) => {
                tracing::warn!(
                    "Error adding or updating dhparam file {}: {}",
                    ns_sec_name,
                    e
                );
                String::new()
            },
        }
    }

    /// Validates candidate bytes by running the configuration-test command
    /// against a temporary file. The file is kept on failure so the
    /// rejected configuration can be inspected.
    pub(crate) async fn test_template(&self, cfg: &[u8]) -> Result<(), NginxError> {
        if cfg.is_empty() {
            return Err(NginxError::ConfigurationTestFailed {
                output: "invalid NGINX configuration (empty)".to_string(),
            });
        }

        let mut tmpfile = tempfile::Builder::new()
            .prefix("nginx-cfg")
            .tempfile()
            .map_err(NginxError::ConfigurationWriteFailed)?;
        tmpfile
            .write_all(cfg)
            .map_err(NginxError::ConfigurationWriteFailed)?;

        let output = Command::new(&self.cfg.nginx_binary)
            .args(["-t", "-c"])
            .arg(tmpfile.path())
            .output()
            .await
            .map_err(|e| NginxError::ConfigurationTestFailed {
                output: e.to_string(),
            })?;

        if !output.status.success() {
            // keep the temporary file around for inspection
            let path = tmpfile.into_temp_path().keep().ok();
            return Err(NginxError::ConfigurationTestFailed {
                output: format!(
                    "\n-------------------------------------------------------------------------------\nError: {}\n{}{}\nrejected configuration kept at {:?}\n-------------------------------------------------------------------------------",
                    output.status,
                    String::from_utf8_lossy(&output.stdout),
                    String::from_utf8_lossy(&output.stderr),
                    path
                ),
            });
        }

        Ok(())
    }

    /// Logs a unified diff between the live configuration and the new
    /// candidate when debug logging is enabled.
    fn log_configuration_diff(&self, content: &[u8]) {
        if !tracing::enabled!(tracing::Level::DEBUG) {
            return;
        }

        let src = match std::fs::read(&self.cfg.cfg_path) {
            Ok(src) => src,
            Err(_) => return,
        };
        if src == content {
            return;
        }

        let tmpfile = match tempfile::Builder::new().prefix("new-nginx-cfg").tempfile() {
            Ok(mut tmpfile) => match tmpfile.write_all(content) {
                Ok(()) => tmpfile,
                Err(_) => return,
            },
            Err(_) => return,
        };

        if let Ok(output) = std::process::Command::new("diff")
            .arg("-u")
            .arg(&self.cfg.cfg_path)
            .arg(tmpfile.path())
            .output()
        {
            tracing::debug!(
                "NGINX configuration diff:\n{}",
                String::from_utf8_lossy(&output.stdout)
            );
        }
    }
}

/// The smallest power-of-two bucket size that fits the longest server
/// name in NGINX's hash tables.
pub fn nginx_hash_bucket_size(longest_string: usize) -> usize {
    let word_size = 8; // assume a 64 bit CPU
    let n = longest_string + 2;
    let aligned = (n + word_size - 1) & !(word_size - 1);
    let raw_size = word_size + word_size + aligned;
    next_power_of_2(raw_size)
}

// see Sean Anderson's bit twiddling hacks for the derivation
pub fn next_power_of_2(v: usize) -> usize {
    let mut v = v.wrapping_sub(1);
    v |= v >> 1;
    v |= v >> 2;
    v |= v >> 4;
    v |= v >> 8;
    v |= v >> 16;
    v |= v >> 32;
    v.wrapping_add(1)
}

fn write_owner_rw(path: &std::path::Path, content: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::write(path, content)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660))
}

fn sysctl_fs_file_max() -> i64 {
    read_proc_value("/proc/sys/fs/file-max").unwrap_or(1_048_576)
}

fn sysctl_somaxconn() -> i64 {
    let max_conns = read_proc_value("/proc/sys/net/core/somaxconn").unwrap_or(511);
    if max_conns < 512 {
        511
    } else {
        max_conns
    }
}

fn read_proc_value(path: &str) -> Option<i64> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_power_of_2_vectors() {
        assert_eq!(next_power_of_2(0), 0);
        assert_eq!(next_power_of_2(1), 1);
        assert_eq!(next_power_of_2(2), 2);
        assert_eq!(next_power_of_2(3), 4);
        assert_eq!(next_power_of_2(1024), 1024);
        assert_eq!(next_power_of_2(1025), 2048);
    }

    #[test]
    fn next_power_of_2_is_power_of_two_and_large_enough() {
        for v in 1..4096usize {
            let p = next_power_of_2(v);
            assert!(p >= v);
            assert!(p.is_power_of_two());
            if v.is_power_of_two() {
                assert_eq!(p, v);
            }
        }
    }

    #[test]
    fn hash_bucket_size_vectors() {
        assert_eq!(nginx_hash_bucket_size(1), 32);
        assert_eq!(nginx_hash_bucket_size(14), 32);
        assert_eq!(nginx_hash_bucket_size(15), 64);
    }

    #[test]
    fn hash_bucket_size_is_monotone_power_of_two() {
        let mut prev = 0;
        for n in 1..512usize {
            let size = nginx_hash_bucket_size(n);
            assert!(size >= prev);
            assert!(size.is_power_of_two());
            prev = size;
        }
    }

    #[test]
    fn somaxconn_floor_is_511() {
        // the helper clamps small values; on any sane kernel the reported
        // value is never below the floor
        assert!(sysctl_somaxconn() >= 511);
    }
}
