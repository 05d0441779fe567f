//! Listener and Modbus framing constants

use std::time::Duration;

// ============================================================================
// Listener lifecycle
// ============================================================================

/// Backoff between accept attempts in the connection handler
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(500);

/// Upper bound on waiting for the worker pool to drain during teardown
pub const DRAIN_TIMEOUT: Duration = Duration::from_millis(300);

/// Ordinary send failures tolerated before a full listener restart
pub const RETRY_LIMIT: u8 = 10;

// ============================================================================
// Configuration defaults
// ============================================================================

/// Standard Modbus TCP port
pub const DEFAULT_PORT: u16 = 502;

pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Response timeout per attempt
pub const DEFAULT_TIMEOUT_MS: u64 = 500;

/// Resends after a response timeout
pub const DEFAULT_RETRIES: u32 = 2;

// ============================================================================
// Framing
// ============================================================================

/// MBAP header: transaction id (2) + protocol id (2) + length (2) + unit id (1)
pub const MBAP_HEADER_LEN: usize = 7;

/// Max MBAP length field: unit id (1) + max PDU (253)
pub const MAX_MBAP_LENGTH: usize = 254;

/// Min MBAP length field: unit id (1) + function code (1)
pub const MIN_MBAP_LENGTH: usize = 2;

/// Modbus protocol identifier carried in the MBAP header
pub const MODBUS_PROTOCOL_ID: u16 = 0;

/// Smallest encapsulated frame: unit id + function code + exception code + CRC
pub const MIN_ENCAP_FRAME_LEN: usize = 5;

pub const CRC_LEN: usize = 2;

/// Exception responses set the high bit of the function code
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Slave id addressing every device on the line; never answered
pub const BROADCAST_SLAVE_ID: u8 = 0;

// ============================================================================
// Protocol limits
// ============================================================================

pub const MAX_READ_COILS: u16 = 2000;
pub const MAX_READ_REGISTERS: u16 = 125;
pub const MAX_WRITE_COILS: u16 = 1968;
pub const MAX_WRITE_REGISTERS: u16 = 123;
