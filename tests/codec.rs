//! Property-based tests for the wire model and frame codec using proptest
//!
//! These tests validate framing invariants across a wide range of randomly
//! generated inputs, ensuring robust behavior under all conditions.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::BytesMut;
use peer_protocol::core::{Bulk, Direction, FrameCodec, Kind, Message};
use peer_protocol::protocol::IdAllocator;
use proptest::prelude::*;
use serde_json::json;

fn arb_kind() -> impl Strategy<Value = Kind> {
    prop_oneof![
        Just(Kind::Data),
        Just(Kind::Subscription),
        Just(Kind::Communication),
        Just(Kind::Control),
    ]
}

fn arb_direction() -> impl Strategy<Value = Direction> {
    prop_oneof![Just(Direction::Request), Just(Direction::Response)]
}

fn arb_payload() -> impl Strategy<Value = serde_json::Value> {
    prop_oneof![
        any::<bool>().prop_map(serde_json::Value::from),
        any::<i64>().prop_map(serde_json::Value::from),
        "[a-zA-Z0-9 ]{0,64}".prop_map(serde_json::Value::from),
        prop::collection::vec(any::<u16>(), 0..8).prop_map(|v| json!({ "values": v })),
    ]
}

fn arb_bulk() -> impl Strategy<Value = Bulk> {
    (
        arb_kind(),
        arb_direction(),
        prop::collection::vec((100u32..999, arb_payload()), 1..5),
    )
        .prop_map(|(kind, direction, items)| {
            Bulk::new(
                kind,
                direction,
                items
                    .into_iter()
                    .map(|(id, payload)| Message::new(id, payload))
                    .collect(),
            )
        })
}

// Property: any bulk survives serialize -> frame -> deframe -> parse
proptest! {
    #[test]
    fn prop_bulk_frame_round_trip(bulk in arb_bulk()) {
        let codec = FrameCodec::new(4).expect("valid width");

        let wire = bulk.to_wire().expect("serialize");
        let mut framed = BytesMut::new();
        codec.encode_frame(&wire, &mut framed).expect("frame");

        let mut buf = framed;
        let payload = codec.decode_frame(&mut buf).expect("deframe").expect("complete frame");
        let recovered = Bulk::from_wire(&payload).expect("parse");

        prop_assert_eq!(recovered, bulk);
        prop_assert!(buf.is_empty());
    }
}

// Property: concatenated frames come back out in order
proptest! {
    #[test]
    fn prop_back_to_back_frames_keep_order(bulks in prop::collection::vec(arb_bulk(), 1..6)) {
        let codec = FrameCodec::new(4).expect("valid width");

        let mut stream = BytesMut::new();
        for bulk in &bulks {
            let wire = bulk.to_wire().expect("serialize");
            codec.encode_frame(&wire, &mut stream).expect("frame");
        }

        let mut recovered = Vec::new();
        while let Some(payload) = codec.decode_frame(&mut stream).expect("deframe") {
            recovered.push(Bulk::from_wire(&payload).expect("parse"));
        }

        prop_assert_eq!(recovered, bulks);
    }
}

// Property: splitting the byte stream at any point never corrupts a frame
proptest! {
    #[test]
    fn prop_arbitrary_split_points_are_safe(bulk in arb_bulk(), split in 0usize..512) {
        let codec = FrameCodec::new(4).expect("valid width");
        let wire = bulk.to_wire().expect("serialize");
        let mut full = BytesMut::new();
        codec.encode_frame(&wire, &mut full).expect("frame");

        let cut = split.min(full.len());
        let mut buf = BytesMut::from(&full[..cut]);

        // A prefix is either a complete frame (only when cut == len) or
        // "need more bytes" -- never an error, never a wrong frame.
        match codec.decode_frame(&mut buf).expect("prefix decode") {
            Some(payload) => prop_assert_eq!(&payload[..], &wire[..]),
            None => {
                buf.extend_from_slice(&full[cut..]);
                let payload = codec.decode_frame(&mut buf).expect("full decode").expect("complete");
                prop_assert_eq!(&payload[..], &wire[..]);
            }
        }
    }
}

// Property: ids handed out by the allocator are unique while outstanding
proptest! {
    #[test]
    fn prop_outstanding_ids_never_collide(ops in prop::collection::vec(any::<bool>(), 1..300)) {
        let mut ids = IdAllocator::new(100, 150).expect("valid range");
        let mut live = Vec::new();

        for take in ops {
            if take {
                match ids.allocate() {
                    Ok(id) => {
                        prop_assert!(!live.contains(&id));
                        live.push(id);
                    }
                    Err(_) => prop_assert_eq!(live.len(), 50),
                }
            } else if let Some(id) = live.pop() {
                prop_assert!(ids.release(id));
            }
        }
    }
}

#[test]
fn codec_works_through_the_tokio_util_traits() {
    use bytes::Bytes;
    use tokio_util::codec::{Decoder, Encoder};

    let mut codec = FrameCodec::new(4).expect("valid width");
    let mut buf = BytesMut::new();

    codec
        .encode(Bytes::from_static(b"trait-framed"), &mut buf)
        .expect("encode");
    codec
        .encode(Bytes::from_static(b"second"), &mut buf)
        .expect("encode");

    let a = codec.decode(&mut buf).expect("decode").expect("frame");
    let b = codec.decode(&mut buf).expect("decode").expect("frame");
    assert_eq!(&a[..], b"trait-framed");
    assert_eq!(&b[..], b"second");
    assert!(codec.decode(&mut buf).expect("decode").is_none());
}

#[test]
fn narrow_width_refuses_oversize_but_takes_the_rest() {
    let codec = FrameCodec::new(1).expect("valid width");
    let mut buf = BytesMut::new();

    let big = vec![0x42u8; 300];
    assert!(codec.encode_frame(&big, &mut buf).is_err());
    assert!(buf.is_empty());

    let small = vec![0x42u8; 200];
    codec.encode_frame(&small, &mut buf).expect("fits");
    let mut stream = buf;
    let out = codec
        .decode_frame(&mut stream)
        .expect("decode")
        .expect("complete");
    assert_eq!(&out[..], &small[..]);
}
