//! Exhaustive positive-space fuzzer for message encoding/decoding.
//!
//! Unlike random fuzzing (message_decode.rs), this fuzzer steers through
//! all combinations of:
//! - All four message types
//! - Edge-case values (0, 1, MAX) for the two aux words
//! - Empty and boundary-size topics, payloads, and route stacks
//!
//! This ensures we don't miss bugs that occur only with specific
//! type+field combinations that random sampling might not hit.

#![no_main]

use arbor_proto::{KeepaliveStatus, Message, MsgType};
use libfuzzer_sys::fuzz_target;

const ALL_TYPES: &[MsgType] = &[
    MsgType::Request,
    MsgType::Response,
    MsgType::Event,
    MsgType::Keepalive,
];

const U32_EDGES: &[u32] = &[0, 1, 0x1000, u32::MAX / 2, u32::MAX - 1, u32::MAX];

// Payload sizes straddling the 0xff length-prefix boundary
const PAYLOAD_SIZES: &[usize] = &[1, 2, 127, 253, 254, 255, 256, 1024];

const ROUTE_DEPTHS: &[usize] = &[0, 1, 2, 8];

fuzz_target!(|data: &[u8]| {
    if data.len() < 5 {
        return;
    }

    let msg_type = ALL_TYPES[data[0] as usize % ALL_TYPES.len()];
    let aux = U32_EDGES[data[1] as usize % U32_EDGES.len()];
    let payload_size = PAYLOAD_SIZES[data[2] as usize % PAYLOAD_SIZES.len()];
    let route_depth = ROUTE_DEPTHS[data[3] as usize % ROUTE_DEPTHS.len()];
    let with_topic = data[4] & 1 != 0;

    let mut msg = match msg_type {
        MsgType::Keepalive => Message::keepalive(aux, KeepaliveStatus::Normal),
        t => Message::new(t),
    };
    if with_topic {
        msg.set_topic(Some("fuzz.topic".to_string()));
    }
    msg.set_payload(&vec![0xa5u8; payload_size]).unwrap();
    match msg_type {
        MsgType::Request => {
            msg.set_nodeid(aux).unwrap();
            msg.set_matchtag(aux).unwrap();
        }
        MsgType::Response => {
            msg.set_errnum(aux).unwrap();
            msg.set_matchtag(aux).unwrap();
        }
        MsgType::Event => msg.set_seq(aux).unwrap(),
        MsgType::Keepalive => {}
    }
    if route_depth > 0 {
        msg.route_enable();
        for hop in 0..route_depth {
            msg.route_push(hop.to_string()).unwrap();
        }
    }

    let wire = msg.encode();
    assert_eq!(wire.len(), msg.encode_size());
    let back = Message::decode(&wire).expect("encoded message must decode");
    assert_eq!(back, msg);
});
