//! Endpoint message schema and packet codec.
//!
//! Every message travels as one packet:
//!
//! ```text
//! +-----------------+----------------------+-------------------+
//! | header len (LE) | JSON header          | raw payload       |
//! | u32             | header len bytes     | rest of packet    |
//! +-----------------+----------------------+-------------------+
//! ```
//!
//! Only `frame` replies carry a payload: the greyscale bytes of the frame.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::driver::{Acquisition, DeviceInfo, MotorStatus, Options, Status};
use crate::error::{Error, ErrorCode, Result};
use crate::frame_source::{FrameInfo, FrameRequest};

const LEN_PREFIX: usize = std::mem::size_of::<u32>();

/// Client to controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Describe the device.
    Identify,
    /// Current status.
    Status,
    /// Reopen a released device.
    Open,
    /// Apply variant-specific options.
    Configure {
        /// Camera or motor options.
        options: Options,
    },
    /// Read the device; cameras take an optional one-off frame request.
    Acquire {
        /// Geometry for this capture only.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request: Option<FrameRequest>,
    },
    /// Close the peripheral.
    Release,
}

/// Controller to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    /// Answer to `identify`.
    Info(DeviceInfo),
    /// Greeting, and answer to `status`.
    Status(Status),
    /// `open` succeeded.
    Opened,
    /// `configure` succeeded.
    Configured,
    /// `release` succeeded.
    Released,
    /// Motor board reading.
    Reading(MotorStatus),
    /// Frame header; the bytes follow as payload.
    Frame(FrameInfo),
    /// The request failed.
    Error {
        /// Machine-readable reason.
        code: ErrorCode,
        /// Human-readable detail.
        message: String,
    },
}

impl Reply {
    /// Error reply describing `err`.
    pub fn error(err: &Error) -> Self {
        Self::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// A reply with its payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Reply header.
    pub reply: Reply,
    /// Raw bytes following the header; empty except for frames.
    pub payload: Vec<u8>,
}

impl Response {
    /// Reply without payload.
    pub const fn new(reply: Reply) -> Self {
        Self {
            reply,
            payload: Vec::new(),
        }
    }

    /// Error response describing `err`.
    pub fn error(err: &Error) -> Self {
        Self::new(Reply::error(err))
    }

    /// Encode as one packet.
    pub fn to_packet(&self) -> Result<Vec<u8>> {
        encode(&self.reply, &self.payload)
    }

    /// Decode one packet.
    pub fn from_packet(packet: &[u8]) -> Result<Self> {
        let (reply, payload) = decode(packet)?;
        Ok(Self {
            reply,
            payload: payload.to_vec(),
        })
    }
}

impl From<Acquisition> for Response {
    fn from(acquisition: Acquisition) -> Self {
        match acquisition {
            Acquisition::Reading(status) => Self::new(Reply::Reading(status)),
            Acquisition::Frame(info, payload) => Self {
                reply: Reply::Frame(info),
                payload,
            },
        }
    }
}

impl Request {
    /// Encode as one packet.
    pub fn to_packet(&self) -> Result<Vec<u8>> {
        encode(self, &[])
    }

    /// Decode one packet. Requests carry no payload.
    pub fn from_packet(packet: &[u8]) -> Result<Self> {
        let (request, payload) = decode(packet)?;
        if !payload.is_empty() {
            return Err(Error::ProtocolError(format!(
                "unexpected {} byte payload on a request",
                payload.len()
            )));
        }
        Ok(request)
    }
}

/// Build a packet from a JSON header and a raw payload.
pub fn encode<T: Serialize>(header: &T, payload: &[u8]) -> Result<Vec<u8>> {
    let header = serde_json::to_vec(header)?;
    let header_len = u32::try_from(header.len()).map_err(|_| Error::MessageTooLarge {
        size: header.len(),
    })?;
    let mut packet = Vec::with_capacity(LEN_PREFIX + header.len() + payload.len());
    packet.extend_from_slice(&header_len.to_le_bytes());
    packet.extend_from_slice(&header);
    packet.extend_from_slice(payload);
    Ok(packet)
}

/// Split a packet into its parsed header and raw payload.
pub fn decode<T: DeserializeOwned>(packet: &[u8]) -> Result<(T, &[u8])> {
    let (prefix, rest) = packet
        .split_first_chunk::<LEN_PREFIX>()
        .ok_or_else(|| Error::ProtocolError(format!("{} byte packet is too short", packet.len())))?;
    let header_len = u32::from_le_bytes(*prefix) as usize;
    if header_len > rest.len() {
        return Err(Error::ProtocolError(format!(
            "header length {header_len} exceeds packet body of {} bytes",
            rest.len()
        )));
    }
    let (header, payload) = rest.split_at(header_len);
    let header = serde_json::from_slice(header)
        .map_err(|err| Error::ProtocolError(format!("bad header: {err}")))?;
    Ok((header, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverState, MotorPower};
    use crate::traits::FourCC;

    #[test]
    fn test_request_wire_shapes() {
        let parsed = Request::from_packet(
            &encode(
                &serde_json::json!({"op": "acquire", "request": {"width": 320, "height": 240}}),
                &[],
            )
            .expect("encode"),
        )
        .expect("decode");
        assert_eq!(
            parsed,
            Request::Acquire {
                request: Some(FrameRequest::new(320, 240))
            }
        );

        let parsed: Request = serde_json::from_str(r#"{"op":"acquire"}"#).expect("parse");
        assert_eq!(parsed, Request::Acquire { request: None });

        let parsed: Request =
            serde_json::from_str(r#"{"op":"configure","options":{"motor":{"m0":0.25}}}"#)
                .expect("parse");
        assert!(matches!(
            parsed,
            Request::Configure {
                options: Options::Motor(options)
            } if options.m0 == Some(MotorPower::Speed(0.25))
        ));
    }

    #[test]
    fn test_frame_response_keeps_payload() {
        let info = FrameInfo {
            width: 4,
            height: 2,
            format: FourCC::GREY,
            sequence: 7,
        };
        let response = Response::from(Acquisition::Frame(info, (0..8).collect()));
        let packet = response.to_packet().expect("encode");
        assert_eq!(&packet[packet.len() - 8..], &[0, 1, 2, 3, 4, 5, 6, 7]);

        let decoded = Response::from_packet(&packet).expect("decode");
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_reply_tags() {
        let json = serde_json::to_value(Reply::Status(Status {
            state: DriverState::Ready,
            target: None,
            motors: None,
        }))
        .expect("serialize");
        assert_eq!(json, serde_json::json!({"reply": "status", "state": "ready"}));

        let json = serde_json::to_value(Reply::error(&Error::NotReady("closed"))).expect("json");
        assert_eq!(json["reply"], "error");
        assert_eq!(json["code"], "not_ready");
    }

    #[test]
    fn test_malformed_packets_are_protocol_errors() {
        let cases: [&[u8]; 4] = [
            b"",
            &[1, 0],
            &[200, 0, 0, 0, b'{', b'}'],
            &[3, 0, 0, 0, b'{', b'"', b'x'],
        ];
        for packet in cases {
            assert!(matches!(
                Request::from_packet(packet),
                Err(Error::ProtocolError(_))
            ));
        }

        let unknown_op = encode(&serde_json::json!({"op": "dance"}), &[]).expect("encode");
        assert!(matches!(
            Request::from_packet(&unknown_op),
            Err(Error::ProtocolError(_))
        ));
    }

    #[test]
    fn test_requests_reject_payload() {
        let packet = encode(&Request::Status, &[1, 2, 3]).expect("encode");
        assert!(matches!(
            Request::from_packet(&packet),
            Err(Error::ProtocolError(_))
        ));
    }
}
