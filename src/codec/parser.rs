//! Record parser and serializer
//!
//! This module turns typed records into wire bytes and back. Datagram
//! transports carry one record per datagram; stream transports prefix each
//! record with a 2-byte big-endian length and reassemble through
//! [`StreamDecoder`].

use crate::codec::frame::*;
use bytes::{Buf, BytesMut};

pub struct Parser;

impl Parser {
    /// The 4-byte handshake datagram, in network byte order
    pub fn magic() -> [u8; 4] {
        MAGIC_WORD.to_be_bytes()
    }

    pub fn is_magic(buf: &[u8]) -> bool {
        buf == Parser::magic().as_slice()
    }

    /// Serializes a record into its datagram form
    ///
    /// RESET and KEEPALIVE become single-byte records; CONTROL and PACKET
    /// get the type byte, a 2-byte big-endian length, and the payload.
    pub fn marshal(record: &Record) -> crate::Result<Vec<u8>> {
        match record {
            Record::Reset => Ok(vec![RecordType::Reset as u8]),
            Record::KeepAlive => Ok(vec![RecordType::KeepAlive as u8]),
            Record::Control(msg) => {
                let body = msg.to_bytes()?;
                Self::with_header(RecordType::Control, &body)
            }
            Record::Packet(payload) => Self::with_header(RecordType::Packet, payload),
        }
    }

    /// Serializes a record for a stream transport: 2-byte big-endian frame
    /// length followed by the record in datagram form.
    pub fn marshal_stream(record: &Record) -> crate::Result<Vec<u8>> {
        let body = Self::marshal(record)?;
        if body.len() > u16::MAX as usize {
            return Err(format!("stream frame of {} bytes too large", body.len()).into());
        }
        let mut buf = Vec::with_capacity(2 + body.len());
        buf.extend_from_slice(&(body.len() as u16).to_be_bytes());
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    fn with_header(record_type: RecordType, payload: &[u8]) -> crate::Result<Vec<u8>> {
        if payload.len() > u16::MAX as usize {
            return Err(format!("payload of {} bytes too large", payload.len()).into());
        }
        let mut buf = Vec::with_capacity(3 + payload.len());
        buf.push(record_type as u8);
        buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(payload);
        Ok(buf)
    }

    /// Deserializes one record from a complete datagram
    pub fn unmarshal(buf: &[u8]) -> Result<Record, FrameError> {
        if buf.is_empty() {
            return Err(FrameError::TooShort);
        }

        match RecordType::try_from(buf[0])? {
            RecordType::Reset => {
                if buf.len() != 1 {
                    return Err(FrameError::Invalid);
                }
                Ok(Record::Reset)
            }
            RecordType::KeepAlive => {
                if buf.len() != 1 {
                    return Err(FrameError::Invalid);
                }
                Ok(Record::KeepAlive)
            }
            RecordType::Control => {
                let body = Self::body(buf)?;
                let value = serde_json::from_slice(body).map_err(FrameError::BadMessage)?;
                Ok(Record::Control(ControlMessage::from_value(value)?))
            }
            RecordType::Packet => Ok(Record::Packet(Self::body(buf)?.to_vec())),
        }
    }

    fn body(buf: &[u8]) -> Result<&[u8], FrameError> {
        if buf.len() < 3 {
            return Err(FrameError::TooShort);
        }
        let length = u16::from_be_bytes([buf[1], buf[2]]) as usize;
        if buf.len() < 3 + length {
            return Err(FrameError::TooShort);
        }
        Ok(&buf[3..3 + length])
    }
}

/// Incremental decoder for the stream transport
///
/// Bytes read from the socket are appended to the internal buffer; complete
/// frames are split off and decoded as they become available, exactly like
/// the datagram path after the length prefix is stripped.
pub struct StreamDecoder {
    buf: BytesMut,
}

impl StreamDecoder {
    pub fn new() -> Self {
        StreamDecoder {
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Buffer to read socket bytes into (for `AsyncReadExt::read_buf`)
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Splits off and decodes the next complete frame, if any
    ///
    /// `Ok(None)` means more bytes are needed. Errors are unrecoverable:
    /// the frame boundary is lost and the stream must be closed.
    pub fn next_record(&mut self) -> Result<Option<Record>, FrameError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let length = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if length > MAX_RECORD {
            return Err(FrameError::Oversize(length));
        }
        if self.buf.len() < 2 + length {
            return Ok(None);
        }
        self.buf.advance(2);
        let body = self.buf.split_to(length);
        Parser::unmarshal(&body).map(Some)
    }
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_record_round_trip() {
        let payload = vec![0x45, 0x00, 0x00, 0x28, 0xaa, 0xbb];
        let wire = Parser::marshal(&Record::Packet(payload.clone())).unwrap();
        assert_eq!(wire[0], 0x02);
        assert_eq!(u16::from_be_bytes([wire[1], wire[2]]) as usize, payload.len());
        match Parser::unmarshal(&wire).unwrap() {
            Record::Packet(decoded) => assert_eq!(decoded, payload),
            other => panic!("unexpected record: {}", other),
        }
    }

    #[test]
    fn control_record_round_trip() {
        let wire = Parser::marshal(&Record::Control(ControlMessage::ip_request())).unwrap();
        match Parser::unmarshal(&wire).unwrap() {
            Record::Control(msg) => assert_eq!(msg.msg_type(), IP_REQUEST),
            other => panic!("unexpected record: {}", other),
        }
    }

    #[test]
    fn bodyless_records_are_single_bytes() {
        assert_eq!(Parser::marshal(&Record::Reset).unwrap(), vec![0x00]);
        assert_eq!(Parser::marshal(&Record::KeepAlive).unwrap(), vec![0x03]);
        assert!(matches!(Parser::unmarshal(&[0x00]), Ok(Record::Reset)));
        assert!(matches!(Parser::unmarshal(&[0x03]), Ok(Record::KeepAlive)));
    }

    #[test]
    fn bodyless_record_with_trailing_bytes_is_invalid() {
        assert!(matches!(
            Parser::unmarshal(&[0x00, 0x01]),
            Err(FrameError::Invalid)
        ));
        assert!(matches!(
            Parser::unmarshal(&[0x03, 0x00, 0x00]),
            Err(FrameError::Invalid)
        ));
    }

    #[test]
    fn unknown_type_byte_is_reported() {
        assert!(matches!(
            Parser::unmarshal(&[0x7f, 0x00, 0x00]),
            Err(FrameError::UnknownType(0x7f))
        ));
    }

    #[test]
    fn truncated_records_end_early() {
        assert!(matches!(Parser::unmarshal(&[]), Err(FrameError::TooShort)));
        assert!(matches!(
            Parser::unmarshal(&[0x02, 0x00]),
            Err(FrameError::TooShort)
        ));
        // inner length promises more than was received
        assert!(matches!(
            Parser::unmarshal(&[0x02, 0x00, 0x10, 0xaa]),
            Err(FrameError::TooShort)
        ));
    }

    #[test]
    fn malformed_control_json_is_rejected() {
        let wire = [0x01, 0x00, 0x02, b'{', b'x'];
        assert!(matches!(
            Parser::unmarshal(&wire),
            Err(FrameError::BadMessage(_))
        ));
        // valid JSON but no type field
        let body = b"{\"a\":1}";
        let mut wire = vec![0x01, 0x00, body.len() as u8];
        wire.extend_from_slice(body);
        assert!(matches!(Parser::unmarshal(&wire), Err(FrameError::Invalid)));
    }

    #[test]
    fn stream_decoder_reassembles_split_frames() {
        let payload: Vec<u8> = (0..40).collect();
        let wire = Parser::marshal_stream(&Record::Packet(payload.clone())).unwrap();

        let mut decoder = StreamDecoder::new();
        decoder.extend(&wire[..3]);
        assert!(decoder.next_record().unwrap().is_none());
        decoder.extend(&wire[3..]);
        match decoder.next_record().unwrap().unwrap() {
            Record::Packet(decoded) => assert_eq!(decoded, payload),
            other => panic!("unexpected record: {}", other),
        }
        assert!(decoder.next_record().unwrap().is_none());
    }

    #[test]
    fn stream_decoder_handles_back_to_back_frames() {
        let mut wire = Parser::marshal_stream(&Record::Packet(vec![1, 2, 3])).unwrap();
        wire.extend(Parser::marshal_stream(&Record::Control(ControlMessage::ip_confirm())).unwrap());

        let mut decoder = StreamDecoder::new();
        decoder.extend(&wire);
        assert!(matches!(
            decoder.next_record().unwrap().unwrap(),
            Record::Packet(_)
        ));
        assert!(matches!(
            decoder.next_record().unwrap().unwrap(),
            Record::Control(_)
        ));
    }

    #[test]
    fn stream_decoder_rejects_oversize_frames() {
        let mut decoder = StreamDecoder::new();
        decoder.extend(&(MAX_RECORD as u16 + 1).to_be_bytes());
        assert!(matches!(
            decoder.next_record(),
            Err(FrameError::Oversize(_))
        ));
    }

    #[test]
    fn magic_word_wire_format() {
        assert_eq!(Parser::magic(), [0x01, 0x30, 0x6a, 0x15]);
        assert!(Parser::is_magic(&[0x01, 0x30, 0x6a, 0x15]));
        assert!(!Parser::is_magic(&[0x01, 0x30, 0x6a]));
        assert!(!Parser::is_magic(&[0x91, 0x92, 0x93, 0x94]));
    }
}
