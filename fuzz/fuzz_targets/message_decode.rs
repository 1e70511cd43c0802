//! Negative-space fuzzer for the message decoder.
//!
//! Arbitrary bytes must never panic the decoder, and anything that decodes
//! successfully must re-encode to a stream that decodes to the same
//! message.

#![no_main]

use arbor_proto::Message;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(msg) = Message::decode(data) {
        let wire = msg.encode();
        assert_eq!(wire.len(), msg.encode_size());
        let back = Message::decode(&wire).expect("re-encoded message must decode");
        assert_eq!(back, msg);
    }
});
