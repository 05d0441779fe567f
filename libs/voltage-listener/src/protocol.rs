//! Modbus request/response model
//!
//! Only as much of the protocol as the listener needs to frame requests and
//! hand responses back to callers.

use bytes::{BufMut, Bytes, BytesMut};

use crate::constants::{
    BROADCAST_SLAVE_ID, EXCEPTION_FLAG, MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_COILS,
    MAX_WRITE_REGISTERS,
};
use crate::error::{ListenerError, Result};

/// Modbus function codes used by the request constructors
pub mod function {
    pub const READ_COILS: u8 = 0x01;
    pub const READ_DISCRETE_INPUTS: u8 = 0x02;
    pub const READ_HOLDING_REGISTERS: u8 = 0x03;
    pub const READ_INPUT_REGISTERS: u8 = 0x04;
    pub const WRITE_SINGLE_COIL: u8 = 0x05;
    pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
    pub const WRITE_MULTIPLE_COILS: u8 = 0x0F;
    pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
}

/// Modbus request addressed to one slave
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusRequest {
    slave_id: u8,
    function_code: u8,
    data: Bytes,
}

impl ModbusRequest {
    /// Raw request; `data` is the PDU without the function code
    pub fn new(slave_id: u8, function_code: u8, data: impl Into<Bytes>) -> Self {
        Self {
            slave_id,
            function_code,
            data: data.into(),
        }
    }

    pub fn read_coils(slave_id: u8, start: u16, quantity: u16) -> Result<Self> {
        check_quantity("coils", quantity, MAX_READ_COILS)?;
        Ok(Self::read(slave_id, function::READ_COILS, start, quantity))
    }

    pub fn read_discrete_inputs(slave_id: u8, start: u16, quantity: u16) -> Result<Self> {
        check_quantity("discrete inputs", quantity, MAX_READ_COILS)?;
        Ok(Self::read(slave_id, function::READ_DISCRETE_INPUTS, start, quantity))
    }

    pub fn read_holding_registers(slave_id: u8, start: u16, quantity: u16) -> Result<Self> {
        check_quantity("holding registers", quantity, MAX_READ_REGISTERS)?;
        Ok(Self::read(slave_id, function::READ_HOLDING_REGISTERS, start, quantity))
    }

    pub fn read_input_registers(slave_id: u8, start: u16, quantity: u16) -> Result<Self> {
        check_quantity("input registers", quantity, MAX_READ_REGISTERS)?;
        Ok(Self::read(slave_id, function::READ_INPUT_REGISTERS, start, quantity))
    }

    pub fn write_single_coil(slave_id: u8, address: u16, value: bool) -> Self {
        let mut data = BytesMut::with_capacity(4);
        data.put_u16(address);
        data.put_u16(if value { 0xFF00 } else { 0x0000 });
        Self::new(slave_id, function::WRITE_SINGLE_COIL, data.freeze())
    }

    pub fn write_single_register(slave_id: u8, address: u16, value: u16) -> Self {
        let mut data = BytesMut::with_capacity(4);
        data.put_u16(address);
        data.put_u16(value);
        Self::new(slave_id, function::WRITE_SINGLE_REGISTER, data.freeze())
    }

    pub fn write_multiple_coils(slave_id: u8, start: u16, values: &[bool]) -> Result<Self> {
        if values.len() > usize::from(MAX_WRITE_COILS) {
            return Err(too_many("coils", values.len(), MAX_WRITE_COILS));
        }
        check_quantity("coils", values.len() as u16, MAX_WRITE_COILS)?;

        let byte_count = values.len().div_ceil(8);
        let mut packed = vec![0u8; byte_count];
        for (i, _) in values.iter().enumerate().filter(|(_, on)| **on) {
            packed[i / 8] |= 1 << (i % 8);
        }

        let mut data = BytesMut::with_capacity(5 + byte_count);
        data.put_u16(start);
        data.put_u16(values.len() as u16);
        data.put_u8(byte_count as u8);
        data.put_slice(&packed);
        Ok(Self::new(slave_id, function::WRITE_MULTIPLE_COILS, data.freeze()))
    }

    pub fn write_multiple_registers(slave_id: u8, start: u16, values: &[u16]) -> Result<Self> {
        if values.len() > usize::from(MAX_WRITE_REGISTERS) {
            return Err(too_many("registers", values.len(), MAX_WRITE_REGISTERS));
        }
        check_quantity("registers", values.len() as u16, MAX_WRITE_REGISTERS)?;

        let mut data = BytesMut::with_capacity(5 + values.len() * 2);
        data.put_u16(start);
        data.put_u16(values.len() as u16);
        data.put_u8((values.len() * 2) as u8);
        for value in values {
            data.put_u16(*value);
        }
        Ok(Self::new(slave_id, function::WRITE_MULTIPLE_REGISTERS, data.freeze()))
    }

    fn read(slave_id: u8, function_code: u8, start: u16, quantity: u16) -> Self {
        let mut data = BytesMut::with_capacity(4);
        data.put_u16(start);
        data.put_u16(quantity);
        Self::new(slave_id, function_code, data.freeze())
    }

    pub fn slave_id(&self) -> u8 {
        self.slave_id
    }

    pub fn function_code(&self) -> u8 {
        self.function_code
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// PDU length: function code + data
    pub fn pdu_len(&self) -> usize {
        1 + self.data.len()
    }

    /// Append function code + data to `dst`
    pub fn write_pdu(&self, dst: &mut BytesMut) {
        dst.put_u8(self.function_code);
        dst.put_slice(&self.data);
    }

    /// Broadcast requests are never answered
    pub fn expects_response(&self) -> bool {
        self.slave_id != BROADCAST_SLAVE_ID
    }
}

fn check_quantity(what: &str, quantity: u16, max: u16) -> Result<()> {
    if quantity == 0 || quantity > max {
        return Err(ListenerError::config(format!(
            "Invalid {} quantity {} (1..={})",
            what, quantity, max
        )));
    }
    Ok(())
}

fn too_many(what: &str, len: usize, max: u16) -> ListenerError {
    ListenerError::config(format!("Too many {}: {} (max {})", what, len, max))
}

/// Modbus response from one slave
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusResponse {
    slave_id: u8,
    function_code: u8,
    data: Bytes,
}

impl ModbusResponse {
    pub fn new(slave_id: u8, function_code: u8, data: impl Into<Bytes>) -> Self {
        Self {
            slave_id,
            function_code,
            data: data.into(),
        }
    }

    pub fn slave_id(&self) -> u8 {
        self.slave_id
    }

    /// Function code as received (exception bit included)
    pub fn function_code(&self) -> u8 {
        self.function_code
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_exception(&self) -> bool {
        self.function_code & EXCEPTION_FLAG != 0
    }

    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() {
            self.data.first().copied()
        } else {
            None
        }
    }

    /// Register values of a 0x03/0x04 response
    pub fn registers(&self) -> Vec<u16> {
        if self.is_exception() {
            return Vec::new();
        }
        self.payload()
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect()
    }

    /// First `count` bit values of a 0x01/0x02 response
    pub fn coils(&self, count: usize) -> Vec<bool> {
        if self.is_exception() {
            return Vec::new();
        }
        self.payload()
            .iter()
            .flat_map(|byte| (0..8).map(move |bit| byte & (1 << bit) != 0))
            .take(count)
            .collect()
    }

    /// Data after the byte-count field, clamped to what actually arrived
    fn payload(&self) -> &[u8] {
        match self.data.split_first() {
            Some((count, rest)) => &rest[..usize::from(*count).min(rest.len())],
            None => &[],
        }
    }
}
