//! Wire codec
//!
//! Selects framing (encapsulated RTU-over-TCP or MBAP transaction-tagged) and
//! the matching correlation-key strategy for the session controller.

pub mod encap;
pub mod mbap;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::codec::Decoder;

use crate::constants::EXCEPTION_FLAG;
use crate::error::TransportError;
use crate::protocol::{ModbusRequest, ModbusResponse};

pub use encap::{crc16, EncapKeyFactory, EncapParser};
pub use mbap::{MbapParser, TaggedKeyFactory};

/// Wire framing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// RTU frame (unit id + PDU + CRC) carried over TCP
    #[serde(alias = "encap", alias = "rtu")]
    Encapsulated,
    /// MBAP header with transaction id
    #[default]
    #[serde(alias = "mbap", alias = "xa")]
    Tagged,
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framing::Encapsulated => write!(f, "encapsulated"),
            Framing::Tagged => write!(f, "tagged"),
        }
    }
}

/// Parser handed to the session controller
pub type MessageParser = Box<dyn Decoder<Item = IncomingEnvelope, Error = TransportError> + Send>;

/// Parser and key factory for a framing mode
pub fn wire_codec(framing: Framing) -> (MessageParser, Arc<dyn WaitingRoomKeyFactory>) {
    match framing {
        Framing::Encapsulated => (Box::new(EncapParser), Arc::new(EncapKeyFactory)),
        Framing::Tagged => (Box::new(MbapParser), Arc::new(TaggedKeyFactory)),
    }
}

/// Request wrapped for wire transmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEnvelope {
    request: ModbusRequest,
    transaction_id: Option<u16>,
}

impl OutgoingEnvelope {
    pub fn encapsulated(request: ModbusRequest) -> Self {
        Self {
            request,
            transaction_id: None,
        }
    }

    pub fn tagged(request: ModbusRequest, transaction_id: u16) -> Self {
        Self {
            request,
            transaction_id: Some(transaction_id),
        }
    }

    pub fn request(&self) -> &ModbusRequest {
        &self.request
    }

    pub fn transaction_id(&self) -> Option<u16> {
        self.transaction_id
    }

    pub fn expects_response(&self) -> bool {
        self.request.expects_response()
    }

    /// Encode to the wire format implied by the correlation key
    pub fn to_bytes(&self) -> Bytes {
        match self.transaction_id {
            Some(transaction_id) => mbap::encode(transaction_id, &self.request),
            None => encap::encode(&self.request),
        }
    }
}

/// Response as received on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingEnvelope {
    transaction_id: Option<u16>,
    response: ModbusResponse,
}

impl IncomingEnvelope {
    pub fn new(transaction_id: Option<u16>, response: ModbusResponse) -> Self {
        Self {
            transaction_id,
            response,
        }
    }

    pub fn transaction_id(&self) -> Option<u16> {
        self.transaction_id
    }

    pub fn response(&self) -> &ModbusResponse {
        &self.response
    }

    pub fn into_response(self) -> ModbusResponse {
        self.response
    }
}

/// Correlation key matching a request to its response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitingRoomKey {
    /// Single request in flight per slave/function
    Encap { slave_id: u8, function_code: u8 },
    /// Transaction id echoed by the slave
    Tagged {
        transaction_id: u16,
        slave_id: u8,
        function_code: u8,
    },
}

impl fmt::Display for WaitingRoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitingRoomKey::Encap {
                slave_id,
                function_code,
            } => write!(f, "slave={} fc=0x{:02X}", slave_id, function_code),
            WaitingRoomKey::Tagged {
                transaction_id,
                slave_id,
                function_code,
            } => write!(
                f,
                "tid={} slave={} fc=0x{:02X}",
                transaction_id, slave_id, function_code
            ),
        }
    }
}

/// Derives correlation keys for requests and responses
pub trait WaitingRoomKeyFactory: Send + Sync {
    fn request_key(&self, request: &OutgoingEnvelope) -> WaitingRoomKey;

    fn response_key(&self, response: &IncomingEnvelope) -> WaitingRoomKey;
}

/// Function code of a response with the exception bit cleared
pub(crate) fn base_function_code(function_code: u8) -> u8 {
    function_code & !EXCEPTION_FLAG
}
