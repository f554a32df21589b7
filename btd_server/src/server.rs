//! Brings up the local Bluetooth controller and owns its [`Adapter`] for
//! the lifetime of the process.

use std::sync::Arc;

use btd_shared::shutdown::Shutdown;
use btd_transport::device::{Adapter, AdapterConfig};

#[derive(Debug, Default)]
pub struct ServerOpts {
    /// `bluer` adapter name (e.g. `"hci0"`); `None` selects the default
    /// adapter.
    pub adapter: Option<String>,
}

#[derive(Debug)]
pub struct Server {
    adapter: Arc<Adapter>,
    shutdown: Shutdown,
}

impl Server {
    #[tracing::instrument(target = "server")]
    pub async fn run(opts: ServerOpts, shutdown: Shutdown) -> anyhow::Result<Self> {
        let adapter = Adapter::new(AdapterConfig { id: opts.adapter }).await?;
        adapter.set_powered(true).await?;
        adapter.set_pairable(true).await?;
        adapter.set_discoverable(true).await?;
        tracing::info!(
            target = "server",
            dev_id = adapter.dev_id(),
            address = %adapter.address().await?,
            "adapter ready",
        );
        Ok(Self { adapter, shutdown })
    }

    pub fn adapter(&self) -> Arc<Adapter> {
        self.adapter.clone()
    }

    /// Resolves once the process-wide shutdown signal has fired.
    pub async fn closed(&self) {
        self.shutdown.recv_shutdown().await;
    }
}
