//! VoltageEMS Listener-Mode Modbus Master
//!
//! A Modbus TCP master that reverses the usual connection direction: it binds a
//! server socket, waits for the slave device to dial in, and then drives a
//! synchronous request/response exchange over that single inbound connection.
//!
//! ```rust,no_run
//! use voltage_listener::{Framing, ListenerConfig, ModbusRequest, TcpListenerMaster};
//!
//! # async fn run() -> voltage_listener::Result<()> {
//! let master = TcpListenerMaster::new(ListenerConfig::new(5020, Framing::Tagged));
//! master.init().await?;
//!
//! // ... once the slave has connected
//! let request = ModbusRequest::read_holding_registers(1, 0, 10)?;
//! if let Some(response) = master.send(request).await? {
//!     println!("registers: {:?}", response.registers());
//! }
//!
//! master.destroy().await;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod constants;
pub mod error;
pub mod handler;
pub mod master;
pub mod pool;
pub mod protocol;
pub mod session;
pub mod transport;

pub use codec::{Framing, IncomingEnvelope, OutgoingEnvelope, WaitingRoomKey};
pub use config::ListenerConfig;
pub use error::{ExceptionHandler, ListenerError, LoggingExceptionHandler, Result, TransportError};
pub use master::{ListenerStatus, TcpListenerMaster, TcpListenerMasterBuilder};
pub use protocol::{ModbusRequest, ModbusResponse};
pub use transport::EventPoll;
