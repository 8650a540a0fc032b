//! Wire format for forwarded events
//!
//! One frame is a single MessagePack value: a 3-element array
//! `[daemon_id, tag, payload-map]`, or nil — the shutdown sentinel, which no
//! valid event frame can collide with. Frames are streamed back to back over
//! TCP with no extra framing; the encoding is self-delimiting.

use std::io::Cursor;

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{EventError, Result};

/// A decoded event frame, not yet an [`Event`](crate::Event)
#[derive(Debug, Clone, PartialEq)]
pub struct EventFrame {
    pub daemon_id: String,
    pub tag: String,
    pub data: Map<String, Value>,
}

/// One decoded wire frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(EventFrame),
    Sentinel,
}

/// Encode an event frame
pub fn encode_event(daemon_id: &str, tag: &str, data: &Map<String, Value>) -> Result<Vec<u8>> {
    rmp_serde::to_vec(&(daemon_id, tag, data)).map_err(|err| EventError::Encode(err.to_string()))
}

/// Encode the shutdown sentinel
pub fn encode_sentinel() -> Vec<u8> {
    let mut buf = Vec::with_capacity(1);
    // Writing nil into a Vec cannot fail.
    let _ = rmpv::encode::write_value(&mut buf, &rmpv::Value::Nil);
    buf
}

/// Incremental frame decoder over a growable byte buffer.
///
/// Feed raw bytes as they arrive and drain complete frames. A truncated
/// value keeps its bytes buffered until more arrive; a malformed value
/// drops the buffer so the stream can resynchronize on the next message.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes received from the transport
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Decode the next complete frame, if the buffer holds one.
    ///
    /// `Ok(None)` means more bytes are needed. `Err` means the buffered
    /// bytes were not a valid frame; the buffer has been reset.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        let mut cursor = Cursor::new(&self.buf[..]);
        match rmpv::decode::read_value(&mut cursor) {
            Ok(value) => {
                let consumed = cursor.position() as usize;
                self.buf.drain(..consumed);
                frame_from_value(value).map(Some)
            }
            Err(err) if is_incomplete(&err) => Ok(None),
            Err(err) => {
                debug!(buffered = self.buf.len(), "resetting decode buffer");
                self.buf.clear();
                Err(EventError::Malformed(err.to_string()))
            }
        }
    }
}

fn is_incomplete(err: &rmpv::decode::Error) -> bool {
    use rmpv::decode::Error;
    match err {
        Error::InvalidMarkerRead(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => true,
        Error::InvalidDataRead(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => true,
        _ => false,
    }
}

fn frame_from_value(value: rmpv::Value) -> Result<Frame> {
    match value {
        rmpv::Value::Nil => Ok(Frame::Sentinel),
        rmpv::Value::Array(items) => {
            let [daemon_id, tag, data]: [rmpv::Value; 3] =
                items.try_into().map_err(|items: Vec<rmpv::Value>| {
                    EventError::Malformed(format!(
                        "expected a 3-element event frame, got {} elements",
                        items.len()
                    ))
                })?;
            let daemon_id = string_item(daemon_id, "daemon id")?;
            let tag = string_item(tag, "tag")?;
            let data: Value = rmpv::ext::from_value(data)
                .map_err(|err| EventError::Malformed(format!("payload: {err}")))?;
            let Value::Object(data) = data else {
                return Err(EventError::Malformed("payload is not a map".into()));
            };
            Ok(Frame::Event(EventFrame {
                daemon_id,
                tag,
                data,
            }))
        }
        other => Err(EventError::Malformed(format!(
            "expected an event frame or sentinel, got {other}"
        ))),
    }
}

fn string_item(value: rmpv::Value, what: &str) -> Result<String> {
    match value {
        rmpv::Value::String(s) => s
            .into_str()
            .ok_or_else(|| EventError::Malformed(format!("{what} is not valid UTF-8"))),
        other => Err(EventError::Malformed(format!("{what} is not a string, got {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_payload() -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("_stamp".into(), json!("2026-08-25T10:00:00.000000"));
        map.insert("id".into(), json!("minion-1"));
        map
    }

    #[test]
    fn event_frame_round_trips() {
        let payload = sample_payload();
        let bytes = encode_event("m1", "salt/master/m1/start", &payload).expect("encode");

        let mut decoder = FrameDecoder::new();
        decoder.feed(&bytes);
        let frame = decoder.next_frame().expect("decode").expect("complete");
        match frame {
            Frame::Event(frame) => {
                assert_eq!(frame.daemon_id, "m1");
                assert_eq!(frame.tag, "salt/master/m1/start");
                assert_eq!(frame.data, payload);
            }
            Frame::Sentinel => panic!("unexpected sentinel"),
        }
        assert!(decoder.next_frame().expect("empty").is_none());
    }

    #[test]
    fn sentinel_is_distinguishable() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&encode_sentinel());
        assert_eq!(decoder.next_frame().expect("decode"), Some(Frame::Sentinel));
    }

    #[test]
    fn truncated_frame_waits_for_more_bytes() {
        let bytes = encode_event("m1", "tag", &sample_payload()).expect("encode");
        let mut decoder = FrameDecoder::new();

        let (head, tail) = bytes.split_at(bytes.len() / 2);
        decoder.feed(head);
        assert!(decoder.next_frame().expect("incomplete").is_none());
        decoder.feed(tail);
        assert!(matches!(
            decoder.next_frame().expect("decode"),
            Some(Frame::Event(_))
        ));
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let mut decoder = FrameDecoder::new();
        let mut bytes = encode_event("m1", "first", &Map::new()).expect("encode");
        bytes.extend(encode_event("m2", "second", &Map::new()).expect("encode"));
        decoder.feed(&bytes);

        match decoder.next_frame().expect("decode").expect("first frame") {
            Frame::Event(frame) => assert_eq!(frame.tag, "first"),
            Frame::Sentinel => panic!("unexpected sentinel"),
        }
        match decoder.next_frame().expect("decode").expect("second frame") {
            Frame::Event(frame) => assert_eq!(frame.tag, "second"),
            Frame::Sentinel => panic!("unexpected sentinel"),
        }
    }

    #[test]
    fn non_tuple_value_is_malformed() {
        // A lone msgpack integer is neither sentinel nor event frame.
        let mut decoder = FrameDecoder::new();
        decoder.feed(&rmp_serde::to_vec(&7u32).expect("encode"));
        assert!(decoder.next_frame().is_err());
        // Buffer was reset; the decoder keeps working.
        decoder.feed(&encode_sentinel());
        assert_eq!(decoder.next_frame().expect("decode"), Some(Frame::Sentinel));
    }

    #[test]
    fn wrong_arity_is_malformed() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&rmp_serde::to_vec(&("m1", "tag")).expect("encode"));
        assert!(decoder.next_frame().is_err());
    }
}
