//! UDP and TCP endpoints for gossip traffic
//!
//! UDP carries probes, acks, and gossip; TCP carries push/pull exchanges and
//! anything too large for a datagram. Both speak the same frame format. Every
//! TCP socket operation is bounded by the configured timeout.

use crate::message::{
    self, Frame, FRAME_HEADER_LEN, MAX_TCP_FRAME_SIZE, MAX_UDP_PACKET_SIZE,
};
use std::net::SocketAddr;
use std::time::Duration;
use svcmesh_core::{Error, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, info};

/// The engine's network endpoints.
pub struct NetTransport {
    udp: UdpSocket,
    tcp: TcpListener,
    local_addr: SocketAddr,
    tcp_timeout: Duration,
}

impl NetTransport {
    /// Bind UDP and TCP on the same port.
    ///
    /// With port zero the kernel picks the UDP port first and TCP binds the
    /// same number.
    pub async fn bind(bind_addr: SocketAddr, tcp_timeout: Duration) -> Result<Self> {
        let udp = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| Error::transport(format!("udp bind {bind_addr} failed: {e}")))?;
        let local_addr = udp
            .local_addr()
            .map_err(|e| Error::transport(format!("udp local addr: {e}")))?;
        let tcp_addr = SocketAddr::new(bind_addr.ip(), local_addr.port());
        let tcp = TcpListener::bind(tcp_addr)
            .await
            .map_err(|e| Error::transport(format!("tcp bind {tcp_addr} failed: {e}")))?;
        info!(addr = %local_addr, "transport bound");
        Ok(Self {
            udp,
            tcp,
            local_addr,
            tcp_timeout,
        })
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send one encoded frame as a datagram.
    pub async fn send_packet(&self, frame: &[u8], addr: SocketAddr) -> Result<()> {
        if frame.len() > MAX_UDP_PACKET_SIZE {
            return Err(Error::transport(format!(
                "packet too large: {} bytes (max {MAX_UDP_PACKET_SIZE})",
                frame.len()
            )));
        }
        self.udp
            .send_to(frame, addr)
            .await
            .map_err(|e| Error::transport(format!("send to {addr} failed: {e}")))?;
        Ok(())
    }

    /// Receive one datagram.
    pub async fn recv_packet(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        self.udp
            .recv_from(buf)
            .await
            .map_err(|e| Error::transport(format!("udp receive failed: {e}")))
    }

    /// Accept one inbound TCP session.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        self.tcp
            .accept()
            .await
            .map_err(|e| Error::transport(format!("tcp accept failed: {e}")))
    }

    /// Open a TCP session to a peer, bounded by the TCP timeout.
    pub async fn dial(&self, addr: SocketAddr) -> Result<TcpStream> {
        match timeout(self.tcp_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(Error::transport(format!("connect {addr} failed: {e}"))),
            Err(_) => Err(Error::transport(format!("connect {addr} timed out"))),
        }
    }

    /// Write one encoded frame to a TCP stream.
    pub async fn write_frame(&self, stream: &mut TcpStream, frame: &[u8]) -> Result<()> {
        let write = async {
            stream.write_all(frame).await?;
            stream.flush().await
        };
        match timeout(self.tcp_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::transport(format!("tcp write failed: {e}"))),
            Err(_) => Err(Error::transport("tcp write timed out".to_string())),
        }
    }

    /// Read one frame from a TCP stream.
    pub async fn read_frame(&self, stream: &mut TcpStream) -> Result<Frame> {
        let read = async {
            let mut header = [0u8; FRAME_HEADER_LEN];
            stream
                .read_exact(&mut header)
                .await
                .map_err(|e| Error::transport(format!("tcp read failed: {e}")))?;
            let (type_byte, payload_len) = message::decode_header(&header)?;
            if payload_len > MAX_TCP_FRAME_SIZE {
                return Err(Error::decode(format!(
                    "frame too large: {payload_len} bytes"
                )));
            }
            let mut payload = vec![0u8; payload_len];
            stream
                .read_exact(&mut payload)
                .await
                .map_err(|e| Error::transport(format!("tcp read failed: {e}")))?;
            message::decode_payload(type_byte, &payload)
        };
        match timeout(self.tcp_timeout, read).await {
            Ok(result) => result,
            Err(_) => {
                debug!("tcp read timed out");
                Err(Error::transport("tcp read timed out".to_string()))
            }
        }
    }
}
