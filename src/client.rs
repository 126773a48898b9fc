//! Agent side of the hub protocol.
//!
//! Connects to a hub, announces an identity, then receives commands and
//! sends output back. Executing commands is left to the caller.

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol::{Frame, FrameType, WireMode};

/// Read size for raw-mode commands.
const RAW_COMMAND_BUFFER: usize = 4096;

/// A connection from an agent to the hub.
pub struct AgentLink {
    stream: TcpStream,
    wire: WireMode,
}

impl AgentLink {
    /// Connect and send `identity` (`user@host`).
    pub async fn connect(addr: SocketAddr, wire: WireMode, identity: &str) -> io::Result<Self> {
        let mut stream = TcpStream::connect(addr).await?;
        match wire {
            WireMode::Framed => {
                Frame::text(FrameType::Hello, identity)
                    .write_to(&mut stream)
                    .await?
            }
            WireMode::Raw => {
                stream.write_all(identity.as_bytes()).await?;
                stream.flush().await?;
            }
        }
        Ok(Self { stream, wire })
    }

    /// The agent's local address, which the hub reports as the session address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    /// Wait for the next command. `Ok(None)` means the hub closed the connection.
    pub async fn recv_command(&mut self) -> io::Result<Option<String>> {
        match self.wire {
            WireMode::Framed => match Frame::read_from(&mut self.stream).await? {
                Some(frame) => Ok(Some(frame.expect_type(FrameType::Command)?.text_lossy())),
                None => Ok(None),
            },
            WireMode::Raw => {
                let mut buf = vec![0u8; RAW_COMMAND_BUFFER];
                let n = self.stream.read(&mut buf).await?;
                if n == 0 {
                    return Ok(None);
                }
                Ok(Some(String::from_utf8_lossy(&buf[..n]).into_owned()))
            }
        }
    }

    /// Send command output back to the hub.
    pub async fn send_output(&mut self, text: &str) -> io::Result<()> {
        match self.wire {
            WireMode::Framed => {
                Frame::text(FrameType::Output, text)
                    .write_to(&mut self.stream)
                    .await
            }
            WireMode::Raw => {
                self.stream.write_all(text.as_bytes()).await?;
                self.stream.flush().await
            }
        }
    }

    /// Close the connection gracefully.
    pub async fn close(mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}
