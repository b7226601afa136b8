//! Dynamic reconfiguration of the data plane over its admin endpoint.
//!
//! Backends (and certificates, when enabled) are JSON-encoded and POSTed
//! to the local admin port; the endpoint must answer `201 Created`.

use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;
use serde::Serialize;

use resources::objects::service::Service;

use crate::{
    errors::NginxError,
    model::{Backend, Configuration, Server, SSLCert},
};

/// Retry schedule of the patch pipeline: 15 decaying steps starting at one
/// second, with 10% jitter.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub steps: u32,
    pub duration: Duration,
    pub factor: f64,
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            steps: 15,
            duration: Duration::from_secs(1),
            factor: 0.8,
            jitter: 0.1,
        }
    }
}

/// Runs `f` until it succeeds or the retry budget is exhausted, sleeping
/// the (jittered, decaying) backoff duration between attempts.
pub async fn exponential_backoff<F, Fut>(backoff: Backoff, f: F) -> Result<(), NginxError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<(), NginxError>>,
{
    let mut duration = backoff.duration;
    let mut last_err = NginxError::DynamicPatchFailed("retry budget exhausted".to_string());

    for step in 0..backoff.steps {
        match f().await {
            Ok(()) => {
                tracing::debug!("Dynamic reconfiguration succeeded.");
                return Ok(());
            },
            Err(e) => {
                tracing::warn!("Dynamic reconfiguration failed: {}", e);
                last_err = e;
            },
        }

        if step + 1 == backoff.steps {
            break;
        }

        let jitter = if backoff.jitter > 0.0 {
            duration.mul_f64(backoff.jitter * rand::thread_rng().gen::<f64>())
        } else {
            Duration::ZERO
        };
        tokio::time::sleep(duration + jitter).await;
        duration = duration.mul_f64(backoff.factor);
    }

    Err(last_err)
}

/// POSTs the reduced backend view to the data plane; with dynamic
/// certificates enabled the per-server PEM material follows.
pub async fn configure_dynamically(
    client: &reqwest::Client,
    pcfg: &Configuration,
    port: u16,
    dynamic_certificates: bool,
) -> Result<(), NginxError> {
    let backends: Vec<Backend> = pcfg.backends.iter().map(reduced_backend).collect();

    let url = format!("http://localhost:{}/configuration/backends", port);
    post(client, &url, &backends).await?;

    if dynamic_certificates {
        configure_certificates(client, pcfg, port).await?;
    }

    Ok(())
}

/// Strips a backend down to what the balancer needs.
fn reduced_backend(backend: &Backend) -> Backend {
    let service = backend.service.as_ref().map(|svc| Service {
        metadata: Default::default(),
        spec: svc.spec.clone(),
    });

    Backend {
        name: backend.name.clone(),
        port: backend.port.clone(),
        ssl_passthrough: backend.ssl_passthrough,
        session_affinity: backend.session_affinity.clone(),
        upstream_hash_by: backend.upstream_hash_by.clone(),
        load_balancing: backend.load_balancing.clone(),
        service,
        no_server: backend.no_server,
        traffic_shaping_policy: backend.traffic_shaping_policy.clone(),
        alternative_backends: backend.alternative_backends.clone(),
        endpoints: backend.endpoints.clone(),
        ..Default::default()
    }
}

async fn configure_certificates(
    client: &reqwest::Client,
    pcfg: &Configuration,
    port: u16,
) -> Result<(), NginxError> {
    let servers: Vec<Server> = pcfg
        .servers
        .iter()
        .map(|server| Server {
            hostname: server.hostname.clone(),
            ssl_cert: SSLCert {
                pem_cert_key: server.ssl_cert.pem_cert_key.clone(),
                ..Default::default()
            },
            ..Default::default()
        })
        .collect();

    let url = format!("http://localhost:{}/configuration/servers", port);
    post(client, &url, &servers).await
}

async fn post<T: Serialize>(
    client: &reqwest::Client,
    url: &str,
    data: &T,
) -> Result<(), NginxError> {
    tracing::debug!("Posting to {}", url);

    let resp = client
        .post(url)
        .json(data)
        .send()
        .await
        .map_err(|e| NginxError::DynamicPatchFailed(e.to_string()))?;

    if resp.status() != StatusCode::CREATED {
        return Err(NginxError::DynamicPatchFailed(format!(
            "unexpected error code: {}",
            resp.status().as_u16()
        )));
    }

    Ok(())
}
