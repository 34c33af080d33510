//! Connection management.

use crate::error::ClientError;
use canboot_hal::{CanInterface, HalError, UdpBus, RECEIVE_RETRIES, SEND_RETRIES};
use canboot_protocol::{Datagram, FrameSplitter, Reassembler};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, trace};

/// Default reply buffer size per sender (4 KiB).
pub const DEFAULT_REPLY_CAPACITY: usize = 4 * 1024;

/// Node id used by the host when none is configured.
pub const HOST_ID: u8 = 0;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Node id the host sends from. Replies are addressed to it.
    pub source_id: u8,
    /// Retries per frame sent.
    pub send_retries: u32,
    /// Receive polls before a reply is considered missing.
    pub receive_retries: u32,
    /// How often a request is resent to silent nodes.
    pub retry_limit: u32,
    /// Largest reply accepted from one node.
    pub reply_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            source_id: HOST_ID,
            send_retries: SEND_RETRIES,
            receive_retries: RECEIVE_RETRIES,
            retry_limit: 3,
            reply_capacity: DEFAULT_REPLY_CAPACITY,
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source_id(mut self, id: u8) -> Self {
        self.source_id = id;
        self
    }

    pub fn with_receive_retries(mut self, retries: u32) -> Self {
        self.receive_retries = retries;
        self
    }

    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }

    pub fn with_reply_capacity(mut self, capacity: usize) -> Self {
        self.reply_capacity = capacity;
        self
    }
}

/// A datagram connection to the nodes on a bus.
pub struct Connection<B> {
    bus: B,
    config: ConnectionConfig,
    reassembler: Reassembler,
}

impl Connection<UdpBus> {
    /// Opens a connection over the UDP virtual bus.
    ///
    /// `poll_interval` is how long one receive attempt waits, so a reply is
    /// given up on after `receive_retries * poll_interval`.
    pub fn udp(
        bind: SocketAddr,
        nodes: Vec<SocketAddr>,
        poll_interval: Duration,
        config: ConnectionConfig,
    ) -> Result<Self, ClientError> {
        let bus = UdpBus::bind(bind, nodes, poll_interval)?;
        Ok(Self::new(bus, config))
    }
}

impl<B: CanInterface> Connection<B> {
    pub fn new(bus: B, config: ConnectionConfig) -> Self {
        let reassembler = Reassembler::new(config.reply_capacity);
        Self {
            bus,
            config,
            reassembler,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Sends `payload` to every node in `destinations`.
    pub fn send(&mut self, payload: &[u8], destinations: &[u8]) -> Result<(), ClientError> {
        let mut datagram = Datagram::from_parts(destinations, payload)?;
        let mut frames = 0;
        for frame in FrameSplitter::new(&mut datagram, self.config.source_id) {
            self.bus.send(&frame, self.config.send_retries)?;
            frames += 1;
        }
        debug!(
            "Sent {} bytes to {:?} in {} frames",
            payload.len(),
            destinations,
            frames
        );
        Ok(())
    }

    /// Waits for the next reply addressed to the host.
    ///
    /// Returns `Ok(None)` once the bus stays silent for the configured number
    /// of receive polls.
    pub fn receive(&mut self) -> Result<Option<(u8, Vec<u8>)>, ClientError> {
        loop {
            let frame = match self.bus.receive(self.config.receive_retries) {
                Ok(frame) => frame,
                Err(HalError::Timeout(_)) => return Ok(None),
                Err(e) => return Err(e.into()),
            };

            if let Some((source, datagram)) = self.reassembler.push(&frame) {
                if !datagram.is_addressed_to(self.config.source_id) {
                    trace!("Ignoring datagram from node {} not addressed to host", source);
                    continue;
                }
                debug!("Reply from node {}: {} bytes", source, datagram.data().len());
                return Ok(Some((source, datagram.data().to_vec())));
            }
        }
    }

    /// Drops partially received replies.
    pub fn reset(&mut self) {
        self.reassembler.clear();
    }
}
