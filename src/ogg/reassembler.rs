// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rebuilds packets that Ogg splits across pages and hands each one, in
//! stream order, to a per-stream consumer.

use super::page::Page;
use crate::ledger::CorruptionLedger;
use crate::{Error, Result, ToU64, TryVec};
use log::debug;

/// Receives the packets of one logical stream.
pub(crate) trait PacketConsumer: Default {
    /// Take one whole packet. Returns `true` once no more packets are wanted.
    fn consume(&mut self, packet: &[u8]) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    AwaitingFirstPacket,
    Streaming,
    Done,
}

#[derive(Debug)]
struct Pending {
    bytes: TryVec<u8>,
    /// The lacing ended it below 255; a continuation would be damage.
    complete: bool,
}

#[derive(Debug)]
pub(crate) struct LogicalStream<C> {
    pub serial: u32,
    pub consumer: C,
    phase: Phase,
    pending: Option<Pending>,
    delivered: u64,
}

impl<C: PacketConsumer> LogicalStream<C> {
    fn new(serial: u32) -> Self {
        Self {
            serial,
            consumer: C::default(),
            phase: Phase::AwaitingFirstPacket,
            pending: None,
            delivered: 0,
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    fn flush(&mut self, offset: u64, ledger: &mut CorruptionLedger) -> Result<()> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        if self.phase == Phase::Done {
            return Ok(());
        }
        self.delivered += 1;
        self.phase = Phase::Streaming;
        match self.consumer.consume(&pending.bytes) {
            Ok(false) => {},
            Ok(true) => {
                debug!("stream {:#x} done after {} packets", self.serial, self.delivered);
                self.phase = Phase::Done;
            },
            Err(err) if err.is_recoverable() => {
                ledger.record(offset, format_args!("stream {:#x}: {err}", self.serial));
                self.phase = Phase::Done;
            },
            Err(err) => return Err(err),
        }
        Ok(())
    }

    fn abandon(&mut self, offset: u64, ledger: &mut CorruptionLedger) {
        ledger.record(offset, format_args!("stream {:#x}: packet exceeds the size limit", self.serial));
        self.pending = None;
        self.phase = Phase::Done;
    }
}

/// Per-stream packet reassembly, keyed by stream serial number.
#[derive(Debug)]
pub(crate) struct Reassembler<C> {
    streams: TryVec<LogicalStream<C>>,
    max_packet_size: Option<u64>,
}

impl<C: PacketConsumer> Reassembler<C> {
    pub(crate) fn new(max_packet_size: Option<u64>) -> Self {
        Self {
            streams: TryVec::new(),
            max_packet_size,
        }
    }

    pub(crate) fn streams(&self) -> &[LogicalStream<C>] {
        &self.streams
    }

    /// Whether every stream seen so far wants no more packets.
    pub(crate) fn all_done(&self) -> bool {
        !self.streams.is_empty() && self.streams.iter().all(|s| s.phase == Phase::Done)
    }

    fn stream_mut(&mut self, serial: u32) -> Result<&mut LogicalStream<C>> {
        let position = match self.streams.iter().position(|s| s.serial == serial) {
            Some(position) => position,
            None => {
                debug!("new Ogg stream {serial:#x}");
                self.streams.push(LogicalStream::new(serial))?;
                self.streams.len() - 1
            },
        };
        self.streams.get_mut(position).ok_or(Error::OutOfBounds("stream index"))
    }

    /// Feed one page and its body.
    ///
    /// Packets that end on this page are delivered, except the last one:
    /// it stays pending until the next page of the stream shows whether it
    /// carries on.
    pub(crate) fn push_page(&mut self, page: &Page, body: &[u8], ledger: &mut CorruptionLedger) -> Result<()> {
        let max_packet_size = self.max_packet_size;
        let stream = self.stream_mut(page.serial)?;
        if stream.phase == Phase::Done {
            return Ok(());
        }

        let continued = page.continued();
        if !continued {
            stream.flush(page.offset, ledger)?;
        } else if stream.pending.as_ref().is_some_and(|p| p.complete) {
            ledger.record(page.offset, "Ogg page continues a packet that already ended");
            stream.flush(page.offset, ledger)?;
        }

        let mut at = 0usize;
        for (i, packet) in page.packets().enumerate() {
            let bytes = body
                .get(at..at + packet.len)
                .ok_or(Error::UnexpectedEOF)?;
            at += packet.len;

            if i == 0 && continued {
                match &mut stream.pending {
                    Some(pending) => {
                        pending.bytes.extend_from_slice(bytes)?;
                        pending.complete = packet.complete;
                    },
                    None => {
                        // The start of this packet was never seen
                        debug!("dropping {} orphaned bytes of stream {:#x}", bytes.len(), page.serial);
                        continue;
                    },
                }
            } else {
                stream.flush(page.offset, ledger)?;
                if stream.phase == Phase::Done {
                    break;
                }
                let mut fresh = TryVec::new();
                fresh.extend_from_slice(bytes)?;
                stream.pending = Some(Pending {
                    bytes: fresh,
                    complete: packet.complete,
                });
            }

            let pending_len = stream.pending.as_ref().map_or(0, |p| p.bytes.len().to_u64());
            if max_packet_size.is_some_and(|limit| pending_len > limit) {
                stream.abandon(page.offset, ledger);
            }
        }
        Ok(())
    }

    /// Deliver whatever is still pending, at the end of the input.
    pub(crate) fn finish(&mut self, offset: u64, ledger: &mut CorruptionLedger) -> Result<()> {
        for stream in self.streams.iter_mut() {
            if stream.pending.as_ref().is_some_and(|p| !p.complete) {
                ledger.record(offset, format_args!("stream {:#x} ends inside a packet", stream.serial));
                stream.pending = None;
                continue;
            }
            stream.flush(offset, ledger)?;
        }
        Ok(())
    }
}
