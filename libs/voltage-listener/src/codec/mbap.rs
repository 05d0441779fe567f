//! Transaction-tagged framing (Modbus TCP MBAP header)
//!
//! Frame: `[Transaction ID(2)][Protocol ID(2)][Length(2)][Unit ID(1)][PDU(N)]`

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::trace;

use super::{base_function_code, IncomingEnvelope, OutgoingEnvelope, WaitingRoomKey, WaitingRoomKeyFactory};
use crate::constants::{MAX_MBAP_LENGTH, MBAP_HEADER_LEN, MIN_MBAP_LENGTH, MODBUS_PROTOCOL_ID};
use crate::error::TransportError;
use crate::protocol::{ModbusRequest, ModbusResponse};

pub(crate) fn encode(transaction_id: u16, request: &ModbusRequest) -> Bytes {
    let pdu_len = request.pdu_len();
    let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + pdu_len);
    frame.put_u16(transaction_id);
    frame.put_u16(MODBUS_PROTOCOL_ID);
    frame.put_u16((pdu_len + 1) as u16);
    frame.put_u8(request.slave_id());
    request.write_pdu(&mut frame);
    trace!("MBAP TX: {}", hex::encode(&frame));
    frame.freeze()
}

/// Response parser for MBAP framing
#[derive(Debug, Default, Clone, Copy)]
pub struct MbapParser;

impl Decoder for MbapParser {
    type Item = IncomingEnvelope;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < MBAP_HEADER_LEN {
            return Ok(None);
        }

        let protocol_id = u16::from_be_bytes([src[2], src[3]]);
        if protocol_id != MODBUS_PROTOCOL_ID {
            src.clear();
            return Err(TransportError::protocol(format!(
                "Invalid MBAP protocol id: {}",
                protocol_id
            )));
        }

        // Length covers unit id + PDU
        let length = usize::from(u16::from_be_bytes([src[4], src[5]]));
        if !(MIN_MBAP_LENGTH..=MAX_MBAP_LENGTH).contains(&length) {
            src.clear();
            return Err(TransportError::protocol(format!(
                "Invalid MBAP length: {}",
                length
            )));
        }

        let frame_len = MBAP_HEADER_LEN - 1 + length;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let frame = src.split_to(frame_len).freeze();
        trace!("MBAP RX: {}", hex::encode(&frame));

        let transaction_id = u16::from_be_bytes([frame[0], frame[1]]);
        let response = ModbusResponse::new(
            frame[MBAP_HEADER_LEN - 1],
            frame[MBAP_HEADER_LEN],
            frame.slice(MBAP_HEADER_LEN + 1..),
        );
        Ok(Some(IncomingEnvelope::new(Some(transaction_id), response)))
    }
}

/// Correlates on the transaction id echoed by the slave
#[derive(Debug, Default, Clone, Copy)]
pub struct TaggedKeyFactory;

impl WaitingRoomKeyFactory for TaggedKeyFactory {
    fn request_key(&self, request: &OutgoingEnvelope) -> WaitingRoomKey {
        WaitingRoomKey::Tagged {
            transaction_id: request.transaction_id().unwrap_or_default(),
            slave_id: request.request().slave_id(),
            function_code: request.request().function_code(),
        }
    }

    fn response_key(&self, response: &IncomingEnvelope) -> WaitingRoomKey {
        WaitingRoomKey::Tagged {
            transaction_id: response.transaction_id().unwrap_or_default(),
            slave_id: response.response().slave_id(),
            function_code: base_function_code(response.response().function_code()),
        }
    }
}
