//! Property-based tests for STOMP framing.
//!
//! Frames built from arbitrary commands, header text (including characters
//! that must be escaped) and binary bodies must survive encode/decode, and
//! heart-beat messages must never be mistaken for frames.

use parley_proto::{Command, Frame, FrameError, Inbound, escape, unescape};
use proptest::prelude::*;

/// Commands whose headers are escaped on the wire.
fn escaped_command() -> impl Strategy<Value = Command> {
    prop::sample::select(
        Command::ALL.into_iter().filter(|c| c.escapes_headers()).collect::<Vec<_>>(),
    )
}

/// Header text drawn from a charset heavy in escape-worthy characters.
fn header_text() -> impl Strategy<Value = String> {
    prop::collection::vec(
        prop_oneof![
            4 => prop::char::range('a', 'z'),
            1 => Just(':'),
            1 => Just('\\'),
            1 => Just('\n'),
            1 => Just('\r'),
            1 => Just(' '),
            1 => Just('é'),
        ],
        1..24,
    )
    .prop_map(|chars| chars.into_iter().collect())
}

fn arbitrary_frame() -> impl Strategy<Value = Frame> {
    (
        escaped_command(),
        prop::collection::vec((header_text(), header_text()), 0..6),
        prop::collection::vec(any::<u8>(), 0..512),
    )
        .prop_map(|(command, headers, body)| {
            let mut frame = Frame::new(command);
            for (name, value) in headers {
                // content-length is generated by the encoder
                if name != "content-length" {
                    frame = frame.header(name, value);
                }
            }
            frame.with_body(body)
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Encoded frames decode to the same command, headers and body.
    #[test]
    fn prop_frame_roundtrip(frame in arbitrary_frame()) {
        let encoded = frame.encode();
        let Inbound::Frame(decoded) = Frame::decode(&encoded).unwrap() else {
            return Err(TestCaseError::fail("decoded a heart-beat"));
        };

        prop_assert_eq!(decoded.command, frame.command);
        prop_assert_eq!(&decoded.body, &frame.body);

        let expected: Vec<_> = frame.headers.iter().cloned().collect();
        let actual: Vec<_> = decoded
            .headers
            .iter()
            .filter(|(k, _)| k != "content-length" || frame.get("content-length").is_some())
            .cloned()
            .collect();
        prop_assert_eq!(actual, expected);
    }

    /// Escaping is reversible for any text.
    #[test]
    fn prop_escape_reversible(text in ".*") {
        prop_assert_eq!(unescape(&escape(&text)).unwrap(), text);
    }

    /// Escaped text never contains raw separators.
    #[test]
    fn prop_escaped_has_no_separators(text in header_text()) {
        let escaped = escape(&text);
        prop_assert!(!escaped.contains(':'));
        prop_assert!(!escaped.contains('\n'));
        prop_assert!(!escaped.contains('\r'));
    }

    /// Any run of EOLs is a heart-beat.
    #[test]
    fn prop_eol_runs_are_heartbeats(eols in prop::collection::vec(prop_oneof![Just(b'\n'), Just(b'\r')], 1..16)) {
        prop_assert_eq!(Frame::decode(&eols).unwrap(), Inbound::Heartbeat);
    }

    /// Truncating an encoded frame never panics and never yields a frame
    /// with a different body.
    #[test]
    fn prop_truncation_is_detected(frame in arbitrary_frame(), cut in any::<prop::sample::Index>()) {
        let encoded = frame.encode();
        let len = cut.index(encoded.len());
        match Frame::decode(&encoded[..len]) {
            Ok(Inbound::Frame(decoded)) => prop_assert_eq!(decoded.body, frame.body),
            Ok(Inbound::Heartbeat) | Err(_) => {},
        }
    }
}

#[test]
fn empty_input_is_an_error() {
    assert_eq!(Frame::decode(b""), Err(FrameError::Empty));
}
