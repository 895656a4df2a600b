//! Fuzz target for wire decoding.
//!
//! Arbitrary bytes from a peer must never panic the decoder; they either
//! parse into a request/publication or come back as a decode error.

#![no_main]

use libfuzzer_sys::fuzz_target;

use kvmesh::proto;

fuzz_target!(|data: &[u8]| {
    let _ = proto::decode_request(data);
    let _ = proto::decode_publication(data);
    let _ = proto::decode_peer_reply(data);
    let _ = proto::decode_spt_infos(data);
    let _ = proto::decode_counters(data);

    // Whatever decodes must re-encode and decode to the same message.
    if let Ok(request) = proto::decode_request(data) {
        let bytes = proto::encode_request(&request);
        let again = proto::decode_request(&bytes).expect("re-decode of encoded request");
        assert_eq!(again, request);
    }
    if let Ok(publication) = proto::decode_publication(data) {
        let bytes = proto::encode_publication(&publication);
        let again = proto::decode_publication(&bytes).expect("re-decode of encoded publication");
        assert_eq!(again, publication);
    }
});
