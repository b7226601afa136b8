//! SSL-passthrough server list and the HTTPS-port accept loop.
//!
//! The reconciler replaces the server list wholesale; readers observe
//! either the old or the new list. SNI-based fan-out is handled by the
//! separate L4 proxy; connections accepted here are piped to the default
//! backend.

use std::sync::{Arc, RwLock};

use anyhow::Result;
use tokio::{
    io::copy_bidirectional,
    net::{TcpListener, TcpStream},
    sync::watch,
};

#[derive(Debug, Clone, PartialEq)]
pub struct TcpServer {
    pub hostname: String,
    pub ip: String,
    pub port: u16,
    pub proxy_protocol: bool,
}

pub struct TcpProxy {
    default: Option<TcpServer>,
    server_list: RwLock<Arc<Vec<TcpServer>>>,
}

impl TcpProxy {
    pub fn new(default: Option<TcpServer>) -> Self {
        Self {
            default,
            server_list: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Atomically replaces the passthrough server list.
    pub fn update_servers(&self, servers: Vec<TcpServer>) {
        *self.server_list.write().expect("server list poisoned") = Arc::new(servers);
    }

    pub fn servers(&self) -> Arc<Vec<TcpServer>> {
        self.server_list.read().expect("server list poisoned").clone()
    }

    /// Looks a hostname up in the current list, falling back to a wildcard
    /// entry and finally the default server.
    pub fn get(&self, hostname: &str) -> Option<TcpServer> {
        let servers = self.servers();

        if let Some(server) = servers.iter().find(|s| s.hostname == hostname) {
            return Some(server.clone());
        }

        if let Some(server) = servers.iter().find(|s| {
            s.hostname.starts_with("*.") && hostname.ends_with(&s.hostname[1..])
        }) {
            return Some(server.clone());
        }

        self.default.clone()
    }

    /// Pipes an accepted connection to the default backend.
    pub async fn handle(&self, mut conn: TcpStream) {
        let target = match &self.default {
            Some(target) => target.clone(),
            None => return,
        };

        let mut upstream = match TcpStream::connect((target.ip.as_str(), target.port)).await {
            Ok(upstream) => upstream,
            Err(e) => {
                tracing::warn!("Error connecting to passthrough default backend: {}", e);
                return;
            },
        };

        if let Err(e) = copy_bidirectional(&mut conn, &mut upstream).await {
            tracing::debug!("Passthrough connection closed: {}", e);
        }
    }
}

/// Accepts TCP connections on the HTTPS port and hands each one to the
/// proxy until the stop channel fires.
pub async fn accept_loop(
    listener: TcpListener,
    proxy: Arc<TcpProxy>,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = stop.changed() => return Ok(()),
            accepted = listener.accept() => {
                let (conn, remote) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!("Error accepting TCP connection: {}", e);
                        continue;
                    },
                };
                tracing::debug!("Handling connection from remote address {}", remote);
                let proxy = proxy.clone();
                tokio::spawn(async move { proxy.handle(conn).await });
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(hostname: &str) -> TcpServer {
        TcpServer {
            hostname: hostname.to_string(),
            ip: "10.0.0.1".to_string(),
            port: 443,
            proxy_protocol: false,
        }
    }

    #[test]
    fn lookup_prefers_exact_match_over_wildcard() {
        let proxy = TcpProxy::new(Some(server("localhost")));
        proxy.update_servers(vec![server("a.example.com"), server("*.example.com")]);

        assert_eq!(proxy.get("a.example.com").unwrap().hostname, "a.example.com");
        assert_eq!(proxy.get("b.example.com").unwrap().hostname, "*.example.com");
        assert_eq!(proxy.get("other.org").unwrap().hostname, "localhost");
    }

    #[test]
    fn update_replaces_the_whole_list() {
        let proxy = TcpProxy::new(None);
        proxy.update_servers(vec![server("a.example.com")]);
        let before = proxy.servers();

        proxy.update_servers(vec![server("b.example.com")]);
        let after = proxy.servers();

        // the old list is untouched, readers observe one or the other
        assert_eq!(before[0].hostname, "a.example.com");
        assert_eq!(after[0].hostname, "b.example.com");
    }
}
