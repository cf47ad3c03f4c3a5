#![warn(missing_docs)]

//! rtcore transport subsystem: multiplexed message sockets, routing envelope
//! codec, routing table and the connection multiplexer.

pub mod codec;
pub mod connection;
pub mod context;
pub mod error;
pub mod message;
pub mod multiplexer;
pub mod routing;
pub mod socket;
pub mod table;

pub use codec::{
    CommandPreamble, CommandType, ControlMessage, RoutingAction, RoutingCommand, RoutingHeader,
    RoutingStatus, StatusResponse,
};
pub use connection::Connection;
pub use context::{Context, SocketKind};
pub use error::{Result, TransportError};
pub use message::Message;
pub use multiplexer::{LoopState, Multiplexer, MultiplexerConfig};
pub use routing::{DnsResolver, HostResolver, InstanceId, Routing, UuidRouting};
pub use socket::{DealerSocket, Endpoint, PeerId, RouterReceiver, RouterSender, RouterSocket};
pub use table::{Poller, RoutingEntry, RoutingTable};
