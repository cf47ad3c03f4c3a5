//! Routing envelope codec.
//!
//! Two framing formats cross the multiplexer:
//!
//! ```text
//! Routing Header (17 bytes, one frame in front of the payload)
//!   status:u8       0 = CONTINUE, 1 = ERROR
//!   destination:16  instance UUID, big-endian
//!
//! Command Preamble (1 byte, first frame of a control message)
//!   command_type:u8 0 = ROUTING_COMMAND, 1 = STATUS_REQUEST, 2 = STATUS_RESPONSE
//!
//! Routing Command (17 bytes, frame after a ROUTING_COMMAND preamble)
//!   action:u8       0 = OPEN, 1 = CLOSE
//!   destination:16
//!
//! Status Response (20 bytes, frame after a STATUS_RESPONSE preamble)
//!   instance:16
//!   open_destinations:u32 BE
//! ```
//!
//! Payload frames after a routing header are opaque and pass through as-is.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, TransportError};
use crate::message::Message;
use crate::routing::InstanceId;

/// Encoded size of a [`RoutingHeader`].
pub const ROUTING_HEADER_SIZE: usize = 17;
/// Encoded size of a [`CommandPreamble`].
pub const COMMAND_PREAMBLE_SIZE: usize = 1;
/// Encoded size of a [`RoutingCommand`].
pub const ROUTING_COMMAND_SIZE: usize = 17;
/// Encoded size of a [`StatusResponse`].
pub const STATUS_RESPONSE_SIZE: usize = 20;

fn check_len(what: &str, buf: &[u8], expected: usize) -> Result<()> {
    if buf.len() != expected {
        return Err(TransportError::InvalidFrame {
            reason: format!("{} must be {} bytes, got {}", what, expected, buf.len()),
        });
    }
    Ok(())
}

fn read_id(buf: &[u8]) -> InstanceId {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&buf[..16]);
    InstanceId::from_bytes(bytes)
}

/// Delivery status carried in a routing header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RoutingStatus {
    /// Forward to the destination.
    Continue = 0,
    /// Routing failed upstream.
    Error = 1,
}

impl TryFrom<u8> for RoutingStatus {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(RoutingStatus::Continue),
            1 => Ok(RoutingStatus::Error),
            _ => Err(TransportError::UnknownDiscriminant {
                field: "routing status",
                value,
            }),
        }
    }
}

/// Envelope in front of every forwarded message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingHeader {
    /// Delivery status.
    pub status: RoutingStatus,
    /// Destination the payload belongs to.
    pub destination: InstanceId,
}

impl RoutingHeader {
    /// A CONTINUE header for `destination`.
    pub fn continue_to(destination: InstanceId) -> Self {
        Self {
            status: RoutingStatus::Continue,
            destination,
        }
    }

    /// Encodes into a frame.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ROUTING_HEADER_SIZE);
        buf.put_u8(self.status as u8);
        buf.put_slice(self.destination.as_bytes());
        buf.freeze()
    }

    /// Decodes from a frame.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_len("routing header", buf, ROUTING_HEADER_SIZE)?;
        Ok(Self {
            status: RoutingStatus::try_from(buf[0])?,
            destination: read_id(&buf[1..]),
        })
    }
}

/// Removes and decodes the routing header frame of `message`.
pub fn strip_routing_header(message: &mut Message) -> Result<RoutingHeader> {
    let frame = message.pop_front().ok_or_else(|| TransportError::InvalidFrame {
        reason: "missing routing header".to_string(),
    })?;
    RoutingHeader::decode(&frame)
}

/// Prepends `header` to `message`.
pub fn insert_routing_header(message: &mut Message, header: &RoutingHeader) {
    message.push_front(header.encode());
}

/// Kind of control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandType {
    /// Open or close a destination.
    RoutingCommand = 0,
    /// Ask the multiplexer for its status.
    StatusRequest = 1,
    /// Reply to a status request.
    StatusResponse = 2,
}

impl TryFrom<u8> for CommandType {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CommandType::RoutingCommand),
            1 => Ok(CommandType::StatusRequest),
            2 => Ok(CommandType::StatusResponse),
            _ => Err(TransportError::UnknownDiscriminant {
                field: "command type",
                value,
            }),
        }
    }
}

/// First frame of every control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandPreamble {
    /// What follows.
    pub command_type: CommandType,
}

impl CommandPreamble {
    /// Encodes into a frame.
    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&[self.command_type as u8])
    }

    /// Decodes from a frame.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_len("command preamble", buf, COMMAND_PREAMBLE_SIZE)?;
        Ok(Self {
            command_type: CommandType::try_from(buf[0])?,
        })
    }
}

/// Routing table mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RoutingAction {
    /// Bind the destination's frontend.
    Open = 0,
    /// Unbind the destination's frontend.
    Close = 1,
}

impl TryFrom<u8> for RoutingAction {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(RoutingAction::Open),
            1 => Ok(RoutingAction::Close),
            _ => Err(TransportError::UnknownDiscriminant {
                field: "routing action",
                value,
            }),
        }
    }
}

/// OPEN or CLOSE for one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingCommand {
    /// Action to apply.
    pub action: RoutingAction,
    /// Destination it applies to.
    pub destination: InstanceId,
}

impl RoutingCommand {
    /// An OPEN command.
    pub fn open(destination: InstanceId) -> Self {
        Self {
            action: RoutingAction::Open,
            destination,
        }
    }

    /// A CLOSE command.
    pub fn close(destination: InstanceId) -> Self {
        Self {
            action: RoutingAction::Close,
            destination,
        }
    }

    /// Encodes into a frame.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ROUTING_COMMAND_SIZE);
        buf.put_u8(self.action as u8);
        buf.put_slice(self.destination.as_bytes());
        buf.freeze()
    }

    /// Decodes from a frame.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_len("routing command", buf, ROUTING_COMMAND_SIZE)?;
        Ok(Self {
            action: RoutingAction::try_from(buf[0])?,
            destination: read_id(&buf[1..]),
        })
    }
}

/// Answer to a status request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusResponse {
    /// Multiplexer that answered.
    pub instance: InstanceId,
    /// Entries in its routing table.
    pub open_destinations: u32,
}

impl StatusResponse {
    /// Encodes into a frame.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(STATUS_RESPONSE_SIZE);
        buf.put_slice(self.instance.as_bytes());
        buf.put_u32(self.open_destinations);
        buf.freeze()
    }

    /// Decodes from a frame.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_len("status response", buf, STATUS_RESPONSE_SIZE)?;
        Ok(Self {
            instance: read_id(buf),
            open_destinations: u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]),
        })
    }
}

/// A decoded control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// OPEN/CLOSE.
    Routing(RoutingCommand),
    /// Status request.
    StatusRequest,
    /// Status response.
    StatusResponse(StatusResponse),
}

impl ControlMessage {
    /// Builds the frames of this control message.
    pub fn to_message(&self) -> Message {
        let mut message = Message::new();
        match self {
            ControlMessage::Routing(command) => {
                message.push_back(CommandPreamble { command_type: CommandType::RoutingCommand }.encode());
                message.push_back(command.encode());
            }
            ControlMessage::StatusRequest => {
                message.push_back(CommandPreamble { command_type: CommandType::StatusRequest }.encode());
            }
            ControlMessage::StatusResponse(status) => {
                message.push_back(CommandPreamble { command_type: CommandType::StatusResponse }.encode());
                message.push_back(status.encode());
            }
        }
        message
    }

    /// Consumes the control frames at the front of `message`.
    pub fn decode(message: &mut Message) -> Result<Self> {
        let preamble = message.pop_front().ok_or_else(|| TransportError::InvalidFrame {
            reason: "missing command preamble".to_string(),
        })?;
        let mut payload = || {
            message.pop_front().ok_or_else(|| TransportError::InvalidFrame {
                reason: "missing command payload".to_string(),
            })
        };
        match CommandPreamble::decode(&preamble)?.command_type {
            CommandType::RoutingCommand => Ok(ControlMessage::Routing(RoutingCommand::decode(&payload()?)?)),
            CommandType::StatusRequest => Ok(ControlMessage::StatusRequest),
            CommandType::StatusResponse => {
                Ok(ControlMessage::StatusResponse(StatusResponse::decode(&payload()?)?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> InstanceId {
        "00112233-4455-6677-8899-aabbccddeeff".parse().unwrap()
    }

    #[test]
    fn test_routing_header_layout() {
        let encoded = RoutingHeader::continue_to(id()).encode();
        assert_eq!(encoded.len(), ROUTING_HEADER_SIZE);
        assert_eq!(encoded[0], 0);
        assert_eq!(
            &encoded[1..],
            &[0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]
        );

        let error = RoutingHeader {
            status: RoutingStatus::Error,
            destination: id(),
        };
        assert_eq!(error.encode()[0], 1);
    }

    #[test]
    fn test_routing_command_layout() {
        let close = RoutingCommand::close(id()).encode();
        assert_eq!(close.len(), ROUTING_COMMAND_SIZE);
        assert_eq!(close[0], 1);
        assert_eq!(RoutingCommand::decode(&close).unwrap(), RoutingCommand::close(id()));
    }

    #[test]
    fn test_status_response_layout() {
        let status = StatusResponse {
            instance: id(),
            open_destinations: 0x0102_0304,
        };
        let encoded = status.encode();
        assert_eq!(encoded.len(), STATUS_RESPONSE_SIZE);
        assert_eq!(&encoded[16..], &[1, 2, 3, 4]);
        assert_eq!(StatusResponse::decode(&encoded).unwrap(), status);
    }

    #[test]
    fn test_strip_and_insert_header() {
        let mut msg = Message::from_frames(vec![b"identity".to_vec(), b"payload".to_vec()]);
        insert_routing_header(&mut msg, &RoutingHeader::continue_to(id()));
        assert_eq!(msg.len(), 3);
        let header = strip_routing_header(&mut msg).unwrap();
        assert_eq!(header.destination, id());
        assert_eq!(header.status, RoutingStatus::Continue);
        assert_eq!(msg, Message::from_frames(vec![b"identity".to_vec(), b"payload".to_vec()]));
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        assert!(RoutingHeader::decode(&[0u8; 16]).is_err());
        let mut bad_status = [0u8; ROUTING_HEADER_SIZE];
        bad_status[0] = 9;
        assert!(matches!(
            RoutingHeader::decode(&bad_status),
            Err(TransportError::UnknownDiscriminant { value: 9, .. })
        ));
        assert!(CommandPreamble::decode(&[3]).is_err());
        assert!(strip_routing_header(&mut Message::new()).is_err());
    }

    #[test]
    fn test_control_message_frames() {
        let mut open = ControlMessage::Routing(RoutingCommand::open(id())).to_message();
        assert_eq!(open.len(), 2);
        assert_eq!(open.front().unwrap().as_ref(), &[0]);
        assert_eq!(
            ControlMessage::decode(&mut open).unwrap(),
            ControlMessage::Routing(RoutingCommand::open(id()))
        );

        let mut request = ControlMessage::StatusRequest.to_message();
        assert_eq!(request.len(), 1);
        assert_eq!(ControlMessage::decode(&mut request).unwrap(), ControlMessage::StatusRequest);

        let mut truncated = Message::from_frames(vec![vec![0u8]]);
        assert!(ControlMessage::decode(&mut truncated).is_err());
    }
}
