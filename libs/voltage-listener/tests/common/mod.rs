//! Common test utilities: a simulated slave that dials in to the listener

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use voltage_listener::codec::crc16;
use voltage_listener::{Framing, ListenerConfig, TcpListenerMaster};

/// How the simulated slave treats requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveMode {
    /// Answer 0x03 reads; register 0 carries the request's transaction id
    Respond,
    /// Read requests and never answer
    Silent,
}

/// Slave device connected to the listener under test
pub struct SimulatedSlave {
    task: JoinHandle<Result<()>>,
}

impl SimulatedSlave {
    /// Dial `addr` until the listener accepts, then serve requests
    pub async fn connect(addr: SocketAddr, framing: Framing, mode: SlaveMode) -> Result<Self> {
        let stream = dial(addr, Duration::from_secs(5)).await?;
        let task = tokio::spawn(serve(stream, framing, mode));
        Ok(Self { task })
    }

    /// Drop the connection without a goodbye
    pub async fn hang_up(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

async fn dial(addr: SocketAddr, within: Duration) -> Result<TcpStream> {
    let deadline = Instant::now() + within;
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) if Instant::now() >= deadline => bail!("Listener at {} never accepted: {}", addr, e),
            Err(_) => sleep(Duration::from_millis(50)).await,
        }
    }
}

async fn serve(mut stream: TcpStream, framing: Framing, mode: SlaveMode) -> Result<()> {
    loop {
        let (transaction_id, pdu_head) = match framing {
            Framing::Tagged => {
                let mut header = [0u8; 7];
                stream.read_exact(&mut header).await?;
                let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
                let mut pdu = vec![0u8; length - 1];
                stream.read_exact(&mut pdu).await?;
                let mut head = vec![header[6]];
                head.extend_from_slice(&pdu);
                (u16::from_be_bytes([header[0], header[1]]), head)
            },
            Framing::Encapsulated => {
                // Only fixed-length read requests are exercised
                let mut frame = [0u8; 8];
                stream.read_exact(&mut frame).await?;
                if crc16(&frame[..6]).to_le_bytes() != [frame[6], frame[7]] {
                    bail!("Bad request CRC");
                }
                (0, frame[..6].to_vec())
            },
        };

        if mode == SlaveMode::Silent {
            continue;
        }

        let body = read_registers_response(&pdu_head, transaction_id);
        let frame = match framing {
            Framing::Tagged => {
                let mut frame = transaction_id.to_be_bytes().to_vec();
                frame.extend_from_slice(&[0x00, 0x00]);
                frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
                frame.extend_from_slice(&body);
                frame
            },
            Framing::Encapsulated => {
                let mut frame = body.clone();
                frame.extend_from_slice(&crc16(&body).to_le_bytes());
                frame
            },
        };
        stream.write_all(&frame).await?;
    }
}

/// `[unit][fc][byte count][registers...]`; register i is `start + i`, except
/// register 0 which echoes the transaction id
fn read_registers_response(request: &[u8], transaction_id: u16) -> Vec<u8> {
    let (unit, function_code) = (request[0], request[1]);
    if function_code != 0x03 {
        return vec![unit, function_code | 0x80, 0x01];
    }

    let start = u16::from_be_bytes([request[2], request[3]]);
    let quantity = u16::from_be_bytes([request[4], request[5]]);
    let mut body = vec![unit, function_code, (quantity * 2) as u8];
    for i in 0..quantity {
        let value = if i == 0 { transaction_id } else { start.wrapping_add(i) };
        body.extend_from_slice(&value.to_be_bytes());
    }
    body
}

/// Port that was free a moment ago
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .unwrap_or(15020)
}

pub fn local_config(framing: Framing) -> ListenerConfig {
    ListenerConfig::new(free_port(), framing).with_host("127.0.0.1")
}

pub fn listener_addr(master: &TcpListenerMaster) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], master.config().port))
}

/// Poll `condition` every 20ms for up to 5s
pub async fn wait_until<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok()
}
