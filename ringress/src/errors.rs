//! Failure classes of the reload and patch pipelines.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NginxError {
    /// Fatal at startup; on hot reload the last good template is kept.
    #[error("invalid NGINX configuration template: {0}")]
    TemplateInvalid(String),

    /// The candidate configuration was rejected by `nginx -t`; carries the
    /// combined output of the test command.
    #[error("configuration test failed:\n{output}")]
    ConfigurationTestFailed { output: String },

    #[error("error writing configuration: {0}")]
    ConfigurationWriteFailed(#[from] std::io::Error),

    /// The reload command exited non-zero; carries its combined output.
    #[error("error reloading NGINX:\n{output}")]
    ReloadFailed { output: String },

    #[error("error stopping NGINX:\n{output}")]
    QuitFailed { output: String },

    #[error("dynamic reconfiguration failed: {0}")]
    DynamicPatchFailed(String),

    #[error("shutdown already in progress")]
    ShutdownInProgress,
}
