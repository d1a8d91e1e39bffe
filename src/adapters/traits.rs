use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::bus::SharedBus;

/// Context passed to adapter logic during execution
pub struct AdapterContext {
    /// Event bus for publishing events
    pub bus: SharedBus,
    /// Cancellation token for shutdown coordination
    pub shutdown: CancellationToken,
}

/// Adapter-specific connect/run logic, generalized from the teacher's
/// per-protocol `AdapterLogic`. Lifecycle (startup, shutdown, ACK) is
/// handled by [`super::handle::AdapterHandle`]; implementors only provide
/// the connect-and-serve loop.
#[async_trait]
pub trait AdapterLogic: Send + Sync + 'static {
    /// Unique adapter name used in logs and `BusEvent::Adapter*` variants.
    fn name(&self) -> &'static str;

    /// Run the adapter's main loop (connect, subscribe, poll). Returns when
    /// `ctx.shutdown` is triggered or the connection is lost (triggering a
    /// retry with backoff in `AdapterHandle`).
    async fn run(&self, ctx: AdapterContext) -> Result<()>;

    /// Optional: called before run() for one-time setup.
    async fn init(&self) -> Result<()> {
        Ok(())
    }
}
