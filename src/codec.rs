//! Wire codec: a 12-byte little-endian header followed by a
//! JSON body. Reads are blocking-complete (`read_exact`): no short reads are
//! tolerated; framing failures are fatal to the
//! connection, same as a malformed packet killing `vinit`'s rtnetlink
//! connection in `startup::setup_network`.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ErrorKind;

const HEADER_SIZE: u32 = 12;

/// Bit OR'd into a request type to produce the matching response type
/// ("response type = request type with a fixed bit set").
pub const RESPONSE_BIT: u32 = 0x0100_0000;

/// Reserved type carrying asynchronous notifications (`id` is always 0).
pub const NOTIFICATION_TYPE: u32 = 0x0000_00E0;

/// The static catalogue of request kinds ("message catalogue").
/// `kind << 0` distinguishes the operation; direction is carried by
/// [`RESPONSE_BIT`] rather than being part of this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    Create = 1,
    Start = 2,
    ExecuteProcess = 3,
    ShutdownGraceful = 4,
    ShutdownForced = 5,
    SignalProcess = 6,
    GetProperties = 7,
    WaitForProcess = 8,
    ResizeConsole = 9,
    ModifySettings = 10,
    NegotiateProtocol = 11,
    Delete = 12,
}

impl MessageType {
    pub fn from_raw(raw: u32) -> Option<MessageType> {
        Some(match raw {
            1 => MessageType::Create,
            2 => MessageType::Start,
            3 => MessageType::ExecuteProcess,
            4 => MessageType::ShutdownGraceful,
            5 => MessageType::ShutdownForced,
            6 => MessageType::SignalProcess,
            7 => MessageType::GetProperties,
            8 => MessageType::WaitForProcess,
            9 => MessageType::ResizeConsole,
            10 => MessageType::ModifySettings,
            11 => MessageType::NegotiateProtocol,
            12 => MessageType::Delete,
            _ => return None,
        })
    }

    pub fn raw(self) -> u32 {
        self as u32
    }

    /// The response type is a pure function of the request type.
    pub fn response_type(self) -> u32 {
        self.raw() | RESPONSE_BIT
    }
}

/// The 12-byte fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub msg_type: u32,
    pub id: u32,
    pub size: u32,
}

impl Header {
    fn to_bytes(self) -> [u8; 12] {
        let mut buf = [0u8; 12];
        buf[0..4].copy_from_slice(&self.msg_type.to_le_bytes());
        buf[4..8].copy_from_slice(&self.id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    fn from_bytes(buf: [u8; 12]) -> Header {
        Header {
            msg_type: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            id: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            size: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        }
    }
}

/// A decoded frame: header plus raw JSON body bytes.
#[derive(Debug, Clone)]
pub struct Frame {
    pub msg_type: u32,
    pub id: u32,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, ErrorKind> {
        serde_json::from_slice(&self.body)
            .map_err(|e| ErrorKind::Protocol(anyhow::anyhow!("invalid json payload: {e}")))
    }
}

/// Reads exactly one frame from `stream`. A short header or body read, or a
/// size smaller than the header itself, is a fatal protocol error.
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Frame, ErrorKind> {
    let mut header_buf = [0u8; 12];
    stream
        .read_exact(&mut header_buf)
        .await
        .map_err(|e| ErrorKind::Protocol(anyhow::anyhow!("failed to read header: {e}")))?;
    let header = Header::from_bytes(header_buf);

    if header.size < HEADER_SIZE {
        return Err(ErrorKind::Protocol(anyhow::anyhow!(
            "header size {} smaller than header itself",
            header.size
        )));
    }

    let body_len = (header.size - HEADER_SIZE) as usize;
    let mut body = vec![0u8; body_len];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|e| ErrorKind::Protocol(anyhow::anyhow!("truncated body: {e}")))?;

    Ok(Frame {
        msg_type: header.msg_type,
        id: header.id,
        body,
    })
}

/// Serializes `payload` and writes a complete frame to `stream`.
pub async fn write_frame<W: AsyncWrite + Unpin, T: Serialize>(
    stream: &mut W,
    msg_type: u32,
    id: u32,
    payload: &T,
) -> Result<(), ErrorKind> {
    let body = serde_json::to_vec(payload)
        .map_err(|e| ErrorKind::Protocol(anyhow::anyhow!("failed to marshal response: {e}")))?;
    let header = Header {
        msg_type,
        id,
        size: HEADER_SIZE + body.len() as u32,
    };

    stream
        .write_all(&header.to_bytes())
        .await
        .map_err(|e| ErrorKind::Protocol(anyhow::anyhow!("failed to write header: {e}")))?;
    stream
        .write_all(&body)
        .await
        .map_err(|e| ErrorKind::Protocol(anyhow::anyhow!("failed to write body: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Body {
        foo: String,
        n: u32,
    }

    #[tokio::test]
    async fn round_trip_encode_decode() {
        let body = Body { foo: "bar".into(), n: 7 };
        let mut buf = Vec::new();
        write_frame(&mut buf, MessageType::Create.raw(), 42, &body)
            .await
            .unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let frame = read_frame(&mut cursor).await.unwrap();
        assert_eq!(frame.msg_type, MessageType::Create.raw());
        assert_eq!(frame.id, 42);
        let decoded: Body = frame.decode_json().unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn response_type_sets_fixed_bit() {
        assert_eq!(
            MessageType::Create.response_type(),
            MessageType::Create.raw() | RESPONSE_BIT
        );
        assert_eq!(
            MessageType::WaitForProcess.response_type(),
            MessageType::WaitForProcess.raw() | RESPONSE_BIT
        );
    }

    #[tokio::test]
    async fn truncated_body_is_protocol_error() {
        let header = Header {
            msg_type: MessageType::Create.raw(),
            id: 1,
            size: 12 + 10, // claims 10 bytes of body
        };
        let mut buf = header.to_bytes().to_vec();
        buf.extend_from_slice(b"short"); // only 5 bytes, not 10

        let mut cursor = std::io::Cursor::new(buf);
        let result = read_frame(&mut cursor).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn malformed_json_does_not_panic() {
        let mut buf = Vec::new();
        let header = Header {
            msg_type: MessageType::Create.raw(),
            id: 1,
            size: 12 + 3,
        };
        buf.extend_from_slice(&header.to_bytes());
        buf.extend_from_slice(b"{{{");

        let mut cursor = std::io::Cursor::new(buf);
        let frame = read_frame(&mut cursor).await.unwrap();
        let decoded: Result<serde_json::Value, _> = frame.decode_json();
        assert!(decoded.is_err());
    }

    #[test]
    fn message_type_round_trips_through_raw() {
        for mt in [
            MessageType::Create,
            MessageType::Start,
            MessageType::ExecuteProcess,
            MessageType::ShutdownGraceful,
            MessageType::ShutdownForced,
            MessageType::SignalProcess,
            MessageType::GetProperties,
            MessageType::WaitForProcess,
            MessageType::ResizeConsole,
            MessageType::ModifySettings,
            MessageType::NegotiateProtocol,
            MessageType::Delete,
        ] {
            assert_eq!(MessageType::from_raw(mt.raw()), Some(mt));
        }
        assert_eq!(MessageType::from_raw(0xdead), None);
    }
}
