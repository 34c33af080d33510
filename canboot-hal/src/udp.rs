//! Virtual CAN bus over UDP.
//!
//! Each UDP packet carries one encoded [`Frame`]. A node sends every frame to
//! all of its peers, which approximates a shared bus for a handful of
//! simulated nodes and host tools on one machine.

use crate::error::HalError;
use crate::interface::CanInterface;
use bytes::BytesMut;
use canboot_protocol::{Frame, FRAME_WIRE_HEADER_SIZE, MAX_FRAME_DATA};
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;
use tracing::{debug, trace};

/// A bus endpoint bound to a local UDP port.
pub struct UdpBus {
    socket: UdpSocket,
    peers: Vec<SocketAddr>,
}

impl UdpBus {
    /// Binds to `addr`. Each receive attempt waits at most `poll_interval`.
    pub fn bind(
        addr: impl ToSocketAddrs,
        peers: Vec<SocketAddr>,
        poll_interval: Duration,
    ) -> Result<Self, HalError> {
        let socket = UdpSocket::bind(addr)?;
        // A zero timeout would mean blocking forever.
        let poll_interval = poll_interval.max(Duration::from_millis(1));
        socket.set_read_timeout(Some(poll_interval))?;
        debug!(
            "UDP bus bound to {} with {} peers",
            socket.local_addr()?,
            peers.len()
        );
        Ok(Self { socket, peers })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, HalError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn peers(&self) -> &[SocketAddr] {
        &self.peers
    }

    pub fn add_peer(&mut self, peer: SocketAddr) {
        if !self.peers.contains(&peer) {
            self.peers.push(peer);
        }
    }
}

impl CanInterface for UdpBus {
    fn send(&mut self, frame: &Frame, retries: u32) -> Result<(), HalError> {
        let packet = frame.encode();
        let attempts = retries.max(1);

        for peer in &self.peers {
            let mut sent = false;
            for _ in 0..attempts {
                match self.socket.send_to(&packet, peer) {
                    Ok(_) => {
                        sent = true;
                        break;
                    }
                    Err(e) => trace!("Send to {} failed: {}", peer, e),
                }
            }
            if !sent {
                return Err(HalError::RetriesExhausted(retries));
            }
        }
        Ok(())
    }

    fn receive(&mut self, retries: u32) -> Result<Frame, HalError> {
        let mut buf = [0u8; FRAME_WIRE_HEADER_SIZE + MAX_FRAME_DATA];

        for _ in 0..retries.max(1) {
            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    let mut packet = BytesMut::from(&buf[..len]);
                    match Frame::decode(&mut packet) {
                        Ok(Some(frame)) => return Ok(frame),
                        Ok(None) => trace!("Short packet from {}", from),
                        Err(e) => debug!("Bad packet from {}: {}", from, e),
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Err(HalError::Timeout(retries))
    }
}
