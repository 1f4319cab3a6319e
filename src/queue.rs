//! Write-buffer queue.
//!
//! An append-only ordered byte sink shared by every per-stream packetizer.
//! Producers either `append` complete byte runs or `reserve` a slot that is
//! filled later (an open transport packet that the next PES of the same
//! stream may continue). `send` publishes every completed buffer below a
//! given offset through the segment sink; slots that are still open hold
//! publication back so cross-stream byte order is preserved.
//!
//! Buffers are reference-counted [`Bytes`]; the encrypting sink makes its
//! own ciphertext copies, so there is no separate buffer-reuse mode.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::crypt::AesCbcWriter;
use crate::error::{MuxError, Result};

/// Outcome of pushing bytes into the segment sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// The sink accepted the bytes.
    Done,
    /// The sink signalled backpressure; retry after the host unblocks.
    Again,
}

/// Host write callback receiving segment bytes in order.
pub type WriteCallback = Box<dyn FnMut(Bytes) -> Result<WriteStatus> + Send>;

/// The downstream of the queue: either the host callback directly, or the
/// AES-128-CBC write-through wrapping it.
pub enum SegmentSink {
    Callback { callback: WriteCallback, unsent: Option<Bytes> },
    Encrypted(AesCbcWriter),
}

impl SegmentSink {
    pub fn plain(callback: WriteCallback) -> Self {
        SegmentSink::Callback { callback, unsent: None }
    }

    /// Retry anything a previous write left behind on backpressure.
    fn drain(&mut self) -> Result<WriteStatus> {
        match self {
            SegmentSink::Callback { callback, unsent } => match unsent.take() {
                Some(buf) => match callback(buf.clone())? {
                    WriteStatus::Done => Ok(WriteStatus::Done),
                    WriteStatus::Again => {
                        *unsent = Some(buf);
                        Ok(WriteStatus::Again)
                    }
                },
                None => Ok(WriteStatus::Done),
            },
            SegmentSink::Encrypted(aes) => aes.drain(),
        }
    }

    /// Push one buffer. The buffer is considered consumed even on `Again`;
    /// the sink retains whatever it could not deliver and `drain` retries.
    fn write(&mut self, buf: Bytes) -> Result<WriteStatus> {
        match self {
            SegmentSink::Callback { callback, unsent } => {
                debug_assert!(unsent.is_none());
                match callback(buf.clone())? {
                    WriteStatus::Done => Ok(WriteStatus::Done),
                    WriteStatus::Again => {
                        *unsent = Some(buf);
                        Ok(WriteStatus::Again)
                    }
                }
            }
            SegmentSink::Encrypted(aes) => aes.write(&buf),
        }
    }

    /// Final flush; pads and emits the trailing cipher block when encrypting.
    fn finish(&mut self) -> Result<WriteStatus> {
        match self {
            SegmentSink::Callback { .. } => self.drain(),
            SegmentSink::Encrypted(aes) => aes.finish(),
        }
    }
}

enum Chunk {
    Filled { start: u64, data: Bytes },
    /// A reserved slot not yet composed by its packetizer.
    Hole { start: u64, len: u64 },
}

impl Chunk {
    fn end(&self) -> u64 {
        match self {
            Chunk::Filled { start, data } => start + data.len() as u64,
            Chunk::Hole { start, len } => start + len,
        }
    }
}

/// Ordered byte sink with per-producer holdback. See module docs.
pub struct WriteBufferQueue {
    sink: SegmentSink,
    chunks: VecDeque<Chunk>,
    /// Total bytes appended or reserved so far (also the simulated length
    /// counter when driven by the simulation twin).
    pub cur_offset: u64,
    /// Offset below which everything has been handed to the sink.
    sent_offset: u64,
}

impl WriteBufferQueue {
    pub fn new(sink: SegmentSink) -> Self {
        Self {
            sink,
            chunks: VecDeque::new(),
            cur_offset: 0,
            sent_offset: 0,
        }
    }

    /// Append a completed byte run; returns its start offset.
    pub fn append(&mut self, data: &[u8]) -> u64 {
        let start = self.cur_offset;
        self.cur_offset += data.len() as u64;
        self.chunks.push_back(Chunk::Filled {
            start,
            data: Bytes::copy_from_slice(data),
        });
        start
    }

    /// Reserve `len` bytes at the current tail, to be filled later via
    /// [`fill`](Self::fill); returns the slot's start offset.
    pub fn reserve(&mut self, len: u64) -> u64 {
        let start = self.cur_offset;
        self.cur_offset += len;
        self.chunks.push_back(Chunk::Hole { start, len });
        start
    }

    /// Fill a previously reserved slot with its composed bytes.
    pub fn fill(&mut self, slot_start: u64, data: Bytes) -> Result<()> {
        for chunk in self.chunks.iter_mut() {
            if let Chunk::Hole { start, len } = chunk {
                if *start == slot_start {
                    if data.len() as u64 != *len {
                        return Err(MuxError::Unexpected(format!(
                            "slot fill size {} does not match reservation {}",
                            data.len(),
                            len
                        )));
                    }
                    *chunk = Chunk::Filled { start: slot_start, data };
                    return Ok(());
                }
            }
        }
        Err(MuxError::Unexpected(format!(
            "no reserved slot at offset {}",
            slot_start
        )))
    }

    /// Publish every completed chunk that ends at or below `min_offset`.
    /// Stops at the first open slot or on sink backpressure.
    pub fn send(&mut self, min_offset: u64) -> Result<WriteStatus> {
        if self.sink.drain()? == WriteStatus::Again {
            return Ok(WriteStatus::Again);
        }

        while let Some(front) = self.chunks.front() {
            if front.end() > min_offset {
                break;
            }
            let data = match front {
                Chunk::Filled { data, .. } => data.clone(),
                Chunk::Hole { .. } => break,
            };
            let end = front.end();
            self.chunks.pop_front();
            self.sent_offset = end;
            if self.sink.write(data)? == WriteStatus::Again {
                return Ok(WriteStatus::Again);
            }
        }

        Ok(WriteStatus::Done)
    }

    /// Publish everything, then finalize the sink. Every slot must have been
    /// filled by its packetizer by now.
    pub fn flush(&mut self) -> Result<WriteStatus> {
        if self
            .chunks
            .iter()
            .any(|c| matches!(c, Chunk::Hole { .. }))
        {
            return Err(MuxError::Unexpected(
                "flush with an unfilled packet slot".to_string(),
            ));
        }
        if self.send(self.cur_offset)? == WriteStatus::Again {
            return Ok(WriteStatus::Again);
        }
        self.sink.finish()
    }

    /// Reset the length counter for a simulation pass. Only valid while no
    /// real bytes are pending.
    pub fn simulated_start_segment(&mut self) {
        debug_assert!(self.chunks.is_empty());
        self.cur_offset = 0;
        self.sent_offset = 0;
    }

    /// Account `len` bytes without producing them.
    pub fn simulated_append(&mut self, len: u64) -> u64 {
        let start = self.cur_offset;
        self.cur_offset += len;
        start
    }
}
