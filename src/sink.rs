//! Output sinks for structured records
//!
//! The core only hands over ordered field sequences; how they are written is
//! the sink's business. `JsonLinesSink` writes one JSON object per line.

use crate::error::Result;
use crate::record::StructuredRecord;
use std::io::Write;

pub trait RecordSink {
    fn emit(&mut self, record: &StructuredRecord) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct JsonLinesSink<W: Write> {
    writer: W,
    written: u64,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> RecordSink for JsonLinesSink<W> {
    fn emit(&mut self, record: &StructuredRecord) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record).map_err(std::io::Error::from)?;
        self.writer.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Collects records in memory
#[derive(Debug, Default)]
pub struct VecSink {
    pub records: Vec<StructuredRecord>,
}

impl RecordSink for VecSink {
    fn emit(&mut self, record: &StructuredRecord) -> Result<()> {
        self.records.push(record.clone());
        Ok(())
    }
}
