use std::path::Path;

use rtcore_persist::PersistenceConfig;
use rtcore_resource::SchedulerConfig;
use rtcore_transport::MultiplexerConfig;
use serde::{Deserialize, Serialize};

/// Everything a node needs to start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Context bound to resource paths that name none.
    pub node_context: Option<String>,
    /// Prefix of per-destination frontend addresses.
    pub routing_prefix: String,
    /// Upstream connection and poll loop.
    pub multiplexer: MultiplexerConfig,
    /// Durable storage.
    pub persistence: PersistenceConfig,
    /// Resource task pools.
    pub scheduler: SchedulerConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_context: None,
            routing_prefix: "multiplex".to_string(),
            multiplexer: MultiplexerConfig::default(),
            persistence: PersistenceConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Loads a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: NodeConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the node cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.persistence.validate()?;
        if self.routing_prefix.is_empty() {
            anyhow::bail!("routing_prefix must not be empty");
        }
        if self.scheduler.dispatcher_threads == 0 {
            anyhow::bail!("scheduler.dispatcher_threads must be at least 1");
        }
        if let Some(context) = &self.node_context {
            if context.is_empty() || context.contains('/') {
                anyhow::bail!("invalid node_context {:?}", context);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtcore_persist::BackendKind;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = NodeConfig::default();
        assert!(config.node_context.is_none());
        assert_eq!(config.routing_prefix, "multiplex");
        assert_eq!(config.persistence.backend, BackendKind::Journal);
        assert_eq!(config.persistence.block_size(), 4096);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
node_context = "arena"

[multiplexer]
connect_addr = "tcp://10.0.0.5:9000"
resolve_retry_attempts = 3

[persistence]
backend = "embedded"
resource_block_size = 512

[persistence.embedded]
path = "/var/lib/rtcore/kv"

[scheduler]
dispatcher_threads = 2
"#
        )
        .unwrap();

        let config = NodeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.node_context.as_deref(), Some("arena"));
        assert_eq!(config.multiplexer.connect_addr, "tcp://10.0.0.5:9000");
        assert_eq!(config.multiplexer.resolve_retry_attempts, 3);
        assert_eq!(config.persistence.backend, BackendKind::Embedded);
        assert_eq!(config.persistence.block_size(), 512);
        assert_eq!(
            config.persistence.embedded.path,
            std::path::PathBuf::from("/var/lib/rtcore/kv")
        );
        assert_eq!(config.scheduler.dispatcher_threads, 2);
        assert_eq!(config.scheduler.scheduled_threads, 1);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{"routing_prefix": "nodes", "persistence": {{"resource_block_size": 128}}}}"#
        )
        .unwrap();

        let config = NodeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.routing_prefix, "nodes");
        assert_eq!(config.persistence.block_size(), 128);
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(file, r#"{{"persistence": {{"resource_block_size": 16}}}}"#).unwrap();
        assert!(NodeConfig::from_file(file.path()).is_err());

        let config = NodeConfig {
            node_context: Some("a/b".to_string()),
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(NodeConfig::from_file(file.path()).is_err());
    }
}
