//! Splitting datagrams into transport frames and reassembling them.

use crate::datagram::Datagram;
use crate::frame::Frame;
use crate::{MAX_FRAME_DATA, NODE_ID_MASK, START_OF_DATAGRAM_MASK};
use std::collections::HashMap;
use tracing::warn;

/// Iterates a datagram as frames of at most 8 bytes.
///
/// The first frame carries the start-of-datagram marker. Every identifier
/// carries the sender's node id in its low bits. Frames are produced lazily
/// from the datagram's writer, so a caller that stops iterating leaves the
/// writer where it stopped.
pub struct FrameSplitter<'a> {
    datagram: &'a mut Datagram,
    source: u32,
    first: bool,
}

impl<'a> FrameSplitter<'a> {
    /// Creates a splitter emitting frames on behalf of node `source`.
    pub fn new(datagram: &'a mut Datagram, source: u8) -> Self {
        Self {
            datagram,
            source: u32::from(source) & NODE_ID_MASK,
            first: true,
        }
    }
}

impl Iterator for FrameSplitter<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        let mut buf = [0u8; MAX_FRAME_DATA];
        let len = self.datagram.output_bytes(&mut buf);
        if len == 0 {
            return None;
        }

        let id = if self.first {
            self.first = false;
            self.source | START_OF_DATAGRAM_MASK
        } else {
            self.source
        };
        Some(Frame::from_buffer(id, buf, len))
    }
}

/// Host-side reassembly of datagrams arriving from many nodes at once.
///
/// Frames are grouped by the sender id in their identifier; a start marker
/// resets that sender's buffer.
pub struct Reassembler {
    partial: HashMap<u8, Datagram>,
    capacity: usize,
}

impl Reassembler {
    /// Creates a reassembler storing up to `capacity` data bytes per datagram.
    pub fn new(capacity: usize) -> Self {
        Self {
            partial: HashMap::new(),
            capacity,
        }
    }

    /// Feeds one frame. Returns the sender and its datagram once a valid
    /// datagram is complete.
    pub fn push(&mut self, frame: &Frame) -> Option<(u8, Datagram)> {
        let source = frame.source();
        let capacity = self.capacity;
        let datagram = self
            .partial
            .entry(source)
            .or_insert_with(|| Datagram::new(capacity));

        if frame.is_start_of_datagram() {
            datagram.start();
        }
        datagram.input(frame.data());

        if !datagram.is_complete() {
            return None;
        }

        let datagram = self.partial.remove(&source)?;
        if datagram.is_valid() {
            Some((source, datagram))
        } else {
            warn!("Dropping invalid datagram from node {}", source);
            None
        }
    }

    /// Number of senders with a datagram in progress.
    pub fn pending(&self) -> usize {
        self.partial.len()
    }

    /// Discards all partial datagrams.
    pub fn clear(&mut self) {
        self.partial.clear();
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(4096)
    }
}
