use async_trait::async_trait;
use eyre::Result;
use tokio::sync::mpsc;

use crate::config::models::ServerConfig;

/// Trait for configuration providers that can load and watch for configuration changes.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Load and validate the current configuration.
    async fn load_config(&self) -> Result<ServerConfig>;

    /// Take the channel that signals configuration changes. The receiver
    /// exists once; later calls return `None`.
    fn watch(&self) -> Option<mpsc::Receiver<()>>;
}
