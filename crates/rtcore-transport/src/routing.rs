//! Destination identifiers and the routing directory.

use std::net::SocketAddr;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for name-derived destination ids.
pub const DESTINATION_NAMESPACE: Uuid = Uuid::from_u128(0x6a2f_41d3_9b7e_4c1a_8d25_03f1_e6b9_7c40);

/// Default prefix of per-destination in-process addresses.
pub const DEFAULT_MULTIPLEX_PREFIX: &str = "multiplex";

/// Globally unique identifier of a cluster node or destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(Uuid);

impl InstanceId {
    /// Creates a random id.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Builds an id from its 16 big-endian bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// The 16 big-endian bytes of this id.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for InstanceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Directory mapping names and ids to addresses.
///
/// Both lookups are pure: any node computes the same answer without a
/// round trip.
pub trait Routing: Send + Sync {
    /// Id of the destination called `name`.
    fn destination_id(&self, name: &str) -> InstanceId;

    /// Address a destination's frontend socket is bound at.
    fn multiplexed_address(&self, destination: InstanceId) -> String;
}

/// Routing directory deriving ids with UUID v5 and binding in-process.
#[derive(Debug, Clone)]
pub struct UuidRouting {
    prefix: String,
}

impl UuidRouting {
    /// Uses `prefix` for per-destination addresses.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for UuidRouting {
    fn default() -> Self {
        Self::with_prefix(DEFAULT_MULTIPLEX_PREFIX)
    }
}

impl Routing for UuidRouting {
    fn destination_id(&self, name: &str) -> InstanceId {
        InstanceId(Uuid::new_v5(&DESTINATION_NAMESPACE, name.as_bytes()))
    }

    fn multiplexed_address(&self, destination: InstanceId) -> String {
        format!("inproc://{}/{}", self.prefix, destination)
    }
}

/// Resolves `host:port` into socket addresses.
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// Resolves an authority. An error means the name could not be resolved.
    async fn resolve(&self, authority: &str) -> std::io::Result<Vec<SocketAddr>>;
}

/// System resolver backed by `tokio::net::lookup_host`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DnsResolver;

#[async_trait]
impl HostResolver for DnsResolver {
    async fn resolve(&self, authority: &str) -> std::io::Result<Vec<SocketAddr>> {
        Ok(tokio::net::lookup_host(authority).await?.collect())
    }
}
