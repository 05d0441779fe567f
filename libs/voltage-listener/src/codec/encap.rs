//! Encapsulated framing: RTU frame carried over TCP
//!
//! Frame: `[unit id][function code][data...][crc lo][crc hi]`

use bytes::{BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_16_MODBUS};
use tokio_util::codec::Decoder;
use tracing::trace;

use super::{base_function_code, IncomingEnvelope, OutgoingEnvelope, WaitingRoomKey, WaitingRoomKeyFactory};
use crate::constants::{CRC_LEN, EXCEPTION_FLAG, MIN_ENCAP_FRAME_LEN};
use crate::error::TransportError;
use crate::protocol::{ModbusRequest, ModbusResponse};

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// CRC-16/MODBUS; transmitted low byte first
pub fn crc16(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

pub(crate) fn encode(request: &ModbusRequest) -> Bytes {
    let mut frame = BytesMut::with_capacity(1 + request.pdu_len() + CRC_LEN);
    frame.put_u8(request.slave_id());
    request.write_pdu(&mut frame);
    let crc = crc16(&frame);
    frame.put_u16_le(crc);
    trace!("Encap TX: {}", hex::encode(&frame));
    frame.freeze()
}

/// Response parser for encapsulated framing
#[derive(Debug, Default, Clone, Copy)]
pub struct EncapParser;

impl EncapParser {
    /// Full frame length implied by the function code, `None` until enough
    /// bytes are buffered to tell
    fn frame_len(src: &[u8]) -> Result<Option<usize>, TransportError> {
        let function_code = src[1];
        if function_code & EXCEPTION_FLAG != 0 {
            return Ok(Some(MIN_ENCAP_FRAME_LEN));
        }

        match function_code {
            0x01..=0x04 | 0x0C | 0x11 | 0x17 => Ok(src
                .get(2)
                .map(|byte_count| 3 + usize::from(*byte_count) + CRC_LEN)),
            0x05 | 0x06 | 0x08 | 0x0F | 0x10 => Ok(Some(8)),
            0x07 => Ok(Some(5)),
            0x16 => Ok(Some(10)),
            other => Err(TransportError::protocol(format!(
                "Unsupported function code 0x{:02X} in encapsulated frame",
                other
            ))),
        }
    }
}

impl Decoder for EncapParser {
    type Item = IncomingEnvelope;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 2 {
            return Ok(None);
        }

        let frame_len = match Self::frame_len(src) {
            Ok(Some(len)) => len,
            Ok(None) => return Ok(None),
            Err(e) => {
                src.clear();
                return Err(e);
            },
        };
        if src.len() < frame_len {
            return Ok(None);
        }

        let frame = src.split_to(frame_len).freeze();
        trace!("Encap RX: {}", hex::encode(&frame));

        let body_len = frame_len - CRC_LEN;
        let received = u16::from_le_bytes([frame[body_len], frame[body_len + 1]]);
        let computed = crc16(&frame[..body_len]);
        if received != computed {
            return Err(TransportError::protocol(format!(
                "CRC mismatch: received {:04X}, computed {:04X}",
                received, computed
            )));
        }

        let response = ModbusResponse::new(frame[0], frame[1], frame.slice(2..body_len));
        Ok(Some(IncomingEnvelope::new(None, response)))
    }
}

/// One request in flight per slave and function code
#[derive(Debug, Default, Clone, Copy)]
pub struct EncapKeyFactory;

impl WaitingRoomKeyFactory for EncapKeyFactory {
    fn request_key(&self, request: &OutgoingEnvelope) -> WaitingRoomKey {
        WaitingRoomKey::Encap {
            slave_id: request.request().slave_id(),
            function_code: request.request().function_code(),
        }
    }

    fn response_key(&self, response: &IncomingEnvelope) -> WaitingRoomKey {
        WaitingRoomKey::Encap {
            slave_id: response.response().slave_id(),
            function_code: base_function_code(response.response().function_code()),
        }
    }
}
