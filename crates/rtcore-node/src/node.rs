//! Explicit wiring of one node's runtime components.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use rtcore_persist::PersistenceEnvironment;
use rtcore_resource::{DocumentResource, ResourceRuntime};
use rtcore_transport::{Context, LoopState, Multiplexer, UuidRouting};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::NodeConfig;

/// A configured node: transport multiplexer plus resource runtime.
pub struct Node {
    ctx: Context,
    multiplexer: Arc<Multiplexer>,
    resources: ResourceRuntime<DocumentResource>,
}

impl Node {
    /// Opens storage and builds every component without starting traffic.
    pub fn build(config: &NodeConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let env = PersistenceEnvironment::open(&config.persistence)
            .context("failed to open persistence environment")?;
        info!(
            backend = env.backend_name(),
            block_size = config.persistence.block_size(),
            resources = env.resource_count(),
            "persistence environment ready"
        );

        let resources = ResourceRuntime::open(env, config.node_context.clone(), &config.scheduler)
            .context("failed to start resource runtime")?;

        let ctx = Context::new();
        let routing = Arc::new(UuidRouting::with_prefix(config.routing_prefix.clone()));
        let multiplexer = Arc::new(Multiplexer::new(
            ctx.clone(),
            routing,
            config.multiplexer.clone(),
        ));

        Ok(Self {
            ctx,
            multiplexer,
            resources,
        })
    }

    /// Multiplexer handle.
    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.multiplexer
    }

    /// Resource runtime.
    pub fn resources(&self) -> &ResourceRuntime<DocumentResource> {
        &self.resources
    }

    /// Poll loop state updates.
    pub fn state(&self) -> watch::Receiver<LoopState> {
        self.multiplexer.state()
    }

    /// Starts the multiplexer; blocks until the backend is connected.
    pub fn start(&self) -> anyhow::Result<()> {
        self.multiplexer
            .start()
            .context("failed to start multiplexer")?;
        info!(instance = %self.multiplexer.instance_id(), "node started");
        Ok(())
    }

    /// Stops traffic, then drains the resource scheduler. Blocking.
    pub fn shutdown(self, timeout: Duration) {
        if self.multiplexer.is_started() {
            if let Err(e) = self.multiplexer.stop() {
                warn!(error = %e, "multiplexer did not stop cleanly");
            }
        }
        self.resources.shutdown(timeout);

        let leaked = self.ctx.open_connections();
        if leaked > 0 {
            warn!(leaked, "connections still open after shutdown");
        }
        info!("node stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtcore_persist::{PersistenceConfig, ResourcePath};
    use rtcore_resource::Resource;

    fn config(dir: &std::path::Path) -> NodeConfig {
        NodeConfig {
            node_context: Some("test".to_string()),
            persistence: PersistenceConfig::journal(dir).with_block_size(256),
            ..NodeConfig::default()
        }
    }

    #[test]
    fn test_build_without_start() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::build(&config(dir.path())).unwrap();
        assert!(!node.multiplexer().is_started());
        assert_eq!(*node.state().borrow(), LoopState::Stopped);
        node.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_resources_survive_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let node = Node::build(&config(dir.path())).unwrap();
            let mut doc = DocumentResource::new();
            doc.set("owner", "node");
            let id = doc.id();
            let path = ResourcePath::parse("/players/one").unwrap();
            let linked = node.resources().service().add_and_release(&path, doc).unwrap();
            assert_eq!(linked.context(), Some("test"));
            node.shutdown(Duration::from_secs(1));
            id
        };

        let node = Node::build(&config(dir.path())).unwrap();
        let owner = node
            .resources()
            .perform(id, |doc| Ok(doc.get("owner").map(str::to_string)))
            .wait()
            .unwrap();
        assert_eq!(owner.as_deref(), Some("node"));
        node.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let bad = NodeConfig {
            persistence: PersistenceConfig::journal(dir.path()).with_block_size(8),
            ..NodeConfig::default()
        };
        assert!(Node::build(&bad).is_err());
    }
}
