//! Seam to the leader-elected status publisher.
//!
//! The publisher itself runs outside this engine; the controller only
//! hands it the wiring configuration and drives its lifecycle.

use crate::config::ControllerConfig;

/// Settings the status publisher is constructed with.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusConfig {
    pub publish_service: String,
    pub publish_status_address: String,
    pub election_id: String,
    pub update_status_on_shutdown: bool,
    pub use_node_internal_ip: bool,
}

impl StatusConfig {
    pub fn from_controller(cfg: &ControllerConfig) -> Self {
        Self {
            publish_service: cfg.publish_service.clone(),
            publish_status_address: cfg.publish_status_address.clone(),
            election_id: cfg.election_id.clone(),
            update_status_on_shutdown: cfg.update_status_on_shutdown,
            use_node_internal_ip: cfg.use_node_internal_ip,
        }
    }
}

pub trait StatusSync: Send + Sync {
    fn run(&self);

    fn shutdown(&self);
}
