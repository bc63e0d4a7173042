//! Binary request traces.
//!
//! Layout: a little-endian `u32` record count, then blocks of up to `TRACE_BLOCK` records.
//! Each block stores its line addresses (`u64`) followed by the request kinds (`u32`).

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::debug;
use num_traits::FromPrimitive;

use crate::dcache::request::{MemRequest, RequestKind};

pub const TRACE_BLOCK: usize = 10_000;

/// Buffers requests and appends them to a trace file one block at a time.
pub struct TraceRecorder {
    path: PathBuf,
    writer: BufWriter<File>,
    buf: Vec<(u64, RequestKind)>,
    written: u32,
}

impl TraceRecorder {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("cannot create trace {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&0u32.to_le_bytes())?;
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            buf: Vec::with_capacity(TRACE_BLOCK),
            written: 0,
        })
    }

    pub fn record(&mut self, req: &MemRequest) -> Result<()> {
        self.buf.push((req.line_addr, req.kind));
        if self.buf.len() == TRACE_BLOCK {
            self.flush_block()?;
        }
        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        for &(addr, _) in &self.buf {
            self.writer.write_all(&addr.to_le_bytes())?;
        }
        for &(_, kind) in &self.buf {
            self.writer.write_all(&(kind as u32).to_le_bytes())?;
        }
        let Ok(n) = u32::try_from(self.buf.len()) else {
            bail!("trace block of {} records", self.buf.len());
        };
        self.written = self
            .written
            .checked_add(n)
            .with_context(|| format!("trace {} exceeds u32 records", self.path.display()))?;
        self.buf.clear();

        // keep the header valid after every block
        self.writer.seek(SeekFrom::Start(0))?;
        self.writer.write_all(&self.written.to_le_bytes())?;
        self.writer.seek(SeekFrom::End(0))?;
        debug!("trace {}: {} records", self.path.display(), self.written);
        Ok(())
    }

    /// Write the partial block and return the number of records in the file.
    pub fn finish(mut self) -> Result<u32> {
        self.flush_block()?;
        self.writer.flush()?;
        Ok(self.written)
    }
}

/// Replays a trace as `(line_addr, kind)` records.
pub struct TraceReader<R: Read> {
    reader: R,
    remaining: u32,
    block: Vec<(u64, RequestKind)>,
    next: usize,
}

impl TraceReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("cannot open trace {}", path.display()))?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read> TraceReader<R> {
    pub fn new(mut reader: R) -> Result<Self> {
        let mut header = [0u8; 4];
        reader
            .read_exact(&mut header)
            .context("trace is missing its record count")?;
        Ok(Self {
            reader,
            remaining: u32::from_le_bytes(header),
            block: Vec::new(),
            next: 0,
        })
    }

    pub fn remaining(&self) -> u64 {
        self.remaining as u64 + (self.block.len() - self.next) as u64
    }

    fn read_block(&mut self) -> Result<()> {
        let n = (self.remaining as usize).min(TRACE_BLOCK);
        let mut addrs = Vec::with_capacity(n);
        let mut word = [0u8; 8];
        for _ in 0..n {
            self.reader.read_exact(&mut word).context("truncated trace block")?;
            addrs.push(u64::from_le_bytes(word));
        }
        let mut half = [0u8; 4];
        self.block.clear();
        for addr in addrs {
            self.reader.read_exact(&mut half).context("truncated trace block")?;
            let raw = u32::from_le_bytes(half);
            let Some(kind) = RequestKind::from_u32(raw) else {
                bail!("unknown request kind {} in trace", raw);
            };
            self.block.push((addr, kind));
        }
        self.next = 0;
        self.remaining -= n as u32;
        Ok(())
    }

    pub fn next_record(&mut self) -> Result<Option<(u64, RequestKind)>> {
        if self.next == self.block.len() {
            if self.remaining == 0 {
                return Ok(None);
            }
            self.read_block()?;
        }
        let record = self.block[self.next];
        self.next += 1;
        Ok(Some(record))
    }
}

impl<R: Read> Iterator for TraceReader<R> {
    type Item = Result<(u64, RequestKind)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("dramcache_{}_{}.trace", name, std::process::id()))
    }

    #[test]
    fn recorded_requests_replay_in_order_across_blocks() {
        let path = scratch("blocks");
        let mut rec = TraceRecorder::create(&path).expect("create");
        let total = TRACE_BLOCK + 17;
        for i in 0..total as u64 {
            let kind = if i % 3 == 0 {
                RequestKind::Putx
            } else {
                RequestKind::Gets
            };
            rec.record(&MemRequest::new(i * 7, kind, i)).expect("record");
        }
        assert_eq!(rec.finish().expect("finish"), total as u32);

        let reader = TraceReader::open(&path).expect("open");
        assert_eq!(reader.remaining(), total as u64);
        let records: Vec<_> = reader.collect::<Result<_>>().expect("replay");
        assert_eq!(records.len(), total);
        assert_eq!(records[0], (0, RequestKind::Putx));
        assert_eq!(records[1], (7, RequestKind::Gets));
        assert_eq!(records[total - 1].0, (total as u64 - 1) * 7);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn empty_trace_has_only_a_header() {
        let path = scratch("empty");
        let rec = TraceRecorder::create(&path).expect("create");
        assert_eq!(rec.finish().expect("finish"), 0);
        assert_eq!(std::fs::metadata(&path).expect("stat").len(), 4);
        let mut reader = TraceReader::open(&path).expect("open");
        assert!(reader.next_record().expect("read").is_none());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn truncated_or_corrupt_traces_are_errors() {
        let mut bytes = 2u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&5u64.to_le_bytes());
        let mut reader = TraceReader::new(Cursor::new(bytes.clone())).expect("header");
        assert!(reader.next_record().is_err());

        bytes.truncate(4);
        bytes[0] = 1;
        bytes.extend_from_slice(&9u64.to_le_bytes());
        bytes.extend_from_slice(&42u32.to_le_bytes());
        let mut reader = TraceReader::new(Cursor::new(bytes)).expect("header");
        assert!(reader.next_record().is_err());

        assert!(TraceReader::new(Cursor::new(vec![1u8, 0])).is_err());
    }
}
