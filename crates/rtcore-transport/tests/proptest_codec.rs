//! Property tests for the routing envelope codec and stream framing.

use proptest::prelude::*;
use rtcore_transport::codec::{insert_routing_header, strip_routing_header};
use rtcore_transport::message::{read_message, write_message};
use rtcore_transport::{ControlMessage, InstanceId, Message, RoutingCommand, RoutingHeader};

fn instance() -> impl Strategy<Value = InstanceId> {
    any::<[u8; 16]>().prop_map(InstanceId::from_bytes)
}

proptest! {
    #[test]
    fn header_strip_leaves_payload_untouched(
        id in instance(),
        frames in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..6),
    ) {
        let original = Message::from_frames(frames);
        let mut message = original.clone();
        insert_routing_header(&mut message, &RoutingHeader::continue_to(id));
        let header = strip_routing_header(&mut message).unwrap();
        prop_assert_eq!(header.destination, id);
        prop_assert_eq!(message, original);
    }

    #[test]
    fn garbage_header_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..40)) {
        let _ = RoutingHeader::decode(&bytes);
        let mut message = Message::from_frames(vec![bytes]);
        let _ = ControlMessage::decode(&mut message);
    }

    #[test]
    fn routing_commands_decode_to_themselves(id in instance(), open in any::<bool>()) {
        let command = if open { RoutingCommand::open(id) } else { RoutingCommand::close(id) };
        let mut message = ControlMessage::Routing(command).to_message();
        prop_assert_eq!(ControlMessage::decode(&mut message).unwrap(), ControlMessage::Routing(command));
        prop_assert!(message.is_empty());
    }

    #[test]
    fn stream_framing_preserves_frames(
        frames in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..256), 1..8),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let sent = Message::from_frames(frames);
        let received = rt.block_on(async {
            let (mut a, mut b) = tokio::io::duplex(64 * 1024);
            write_message(&mut a, &sent).await.unwrap();
            read_message(&mut b).await.unwrap().unwrap()
        });
        prop_assert_eq!(received, sent);
    }
}
