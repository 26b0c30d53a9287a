//! Property tests for the WebSocket frame codec.

use bytes::BytesMut;
use proptest::prelude::*;

use kiln::websocket::{
    Frame, FrameError, MAX_CONTROL_PAYLOAD, Opcode, ParserConfig, apply_mask, decode_frame,
};

fn data_opcode() -> impl Strategy<Value = Opcode> {
    prop_oneof![Just(Opcode::Binary), Just(Opcode::Continuation)]
}

fn control_opcode() -> impl Strategy<Value = Opcode> {
    prop_oneof![Just(Opcode::Ping), Just(Opcode::Pong)]
}

/// Frames that are valid on their own: data frames of any size the parser accepts,
/// control frames that are final and small.
fn valid_frame() -> impl Strategy<Value = Frame> {
    let data = (
        data_opcode(),
        any::<bool>(),
        prop::collection::vec(any::<u8>(), 0..70_000),
        prop::option::of(any::<[u8; 4]>()),
    )
        .prop_map(|(opcode, fin, payload, mask)| Frame {
            fin,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            mask,
            payload: payload.into(),
        });
    let text = (".{0,200}", prop::option::of(any::<[u8; 4]>())).prop_map(|(text, mask)| Frame {
        mask,
        ..Frame::text(text)
    });
    let control = (
        control_opcode(),
        prop::collection::vec(any::<u8>(), 0..=MAX_CONTROL_PAYLOAD),
        prop::option::of(any::<[u8; 4]>()),
    )
        .prop_map(|(opcode, payload, mask)| Frame {
            mask,
            ..Frame::new(opcode, payload)
        });
    prop_oneof![data, text, control]
}

fn encode(frame: &Frame) -> BytesMut {
    let mut buf = BytesMut::new();
    frame.encode(&mut buf);
    buf
}

proptest! {
    #[test]
    fn masking_round_trips(payload in prop::collection::vec(any::<u8>(), 0..4096), key in any::<[u8; 4]>()) {
        let mut data = payload.clone();
        apply_mask(&mut data, key);
        apply_mask(&mut data, key);
        prop_assert_eq!(data, payload);
    }

    #[test]
    fn frames_round_trip(frame in valid_frame()) {
        let wire = encode(&frame);
        prop_assert_eq!(wire.len(), frame.encoded_len());

        let (parsed, consumed) = decode_frame(&wire, ParserConfig::default())
            .unwrap()
            .expect("a whole frame was encoded");
        prop_assert_eq!(consumed, wire.len());
        prop_assert_eq!(parsed, frame);
    }

    #[test]
    fn truncated_frames_are_incomplete(frame in valid_frame(), cut in any::<prop::sample::Index>()) {
        let wire = encode(&frame);
        let end = cut.index(wire.len());
        prop_assert_eq!(decode_frame(&wire[..end], ParserConfig::default()).unwrap(), None);
    }

    #[test]
    fn oversized_control_frames_are_rejected(
        opcode in prop_oneof![Just(Opcode::Ping), Just(Opcode::Pong), Just(Opcode::Close)],
        len in (MAX_CONTROL_PAYLOAD + 1)..1024,
    ) {
        let mut frame = Frame::new(opcode, vec![0x41; len]);
        if opcode == Opcode::Close {
            frame.payload = Frame::close(Some(kiln::websocket::CloseCode::Normal), &"x".repeat(len)).payload;
        }
        let size = frame.payload.len();
        prop_assert_eq!(frame.validate(), Err(FrameError::ControlFrameTooLarge(size)));

        let err = decode_frame(&encode(&frame), ParserConfig::default()).unwrap_err();
        prop_assert_eq!(err, FrameError::ControlFrameTooLarge(size));
    }
}
