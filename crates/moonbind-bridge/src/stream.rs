//! Adapters between host `io::Read`/`io::Write` objects and the engine's
//! chunked load/dump protocol.
//!
//! Each adapter owns a fixed transfer buffer for the duration of one call
//! and nothing survives the call, on any exit path. A host I/O failure
//! aborts the engine operation and rides along as the fault's payload, so
//! translation can surface it as an `Io` error with the original cause.

use std::io::{Read, Write};

use moonbind_engine::{ChunkSink, ChunkSource, StreamFailure, STREAM_BLOCK};

/// Feeds a load from a host reader, one block of at most [`STREAM_BLOCK`]
/// bytes per request.
pub(crate) struct ReadCursor<'a> {
    reader: &'a mut dyn Read,
    buf: [u8; STREAM_BLOCK],
}

impl<'a> ReadCursor<'a> {
    pub fn new(reader: &'a mut dyn Read) -> Self {
        ReadCursor { reader, buf: [0; STREAM_BLOCK] }
    }
}

impl ChunkSource for ReadCursor<'_> {
    fn read_block(&mut self) -> Result<Option<Vec<u8>>, StreamFailure> {
        loop {
            match self.reader.read(&mut self.buf) {
                Ok(0) => return Ok(None),
                Ok(n) => return Ok(Some(self.buf[..n].to_vec())),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(StreamFailure(Box::new(e))),
            }
        }
    }
}

/// Drains a dump into a host writer.
pub(crate) struct WriteCursor<'a> {
    writer: &'a mut dyn Write,
}

impl<'a> WriteCursor<'a> {
    pub fn new(writer: &'a mut dyn Write) -> Self {
        WriteCursor { writer }
    }
}

impl ChunkSink for WriteCursor<'_> {
    fn write_block(&mut self, block: &[u8]) -> Result<(), StreamFailure> {
        debug_assert!(block.len() <= STREAM_BLOCK);
        self.writer
            .write_all(block)
            .map_err(|e| StreamFailure(Box::new(e)))
    }
}
