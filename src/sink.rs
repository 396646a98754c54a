use crate::metrics::Metrics;
use crate::record::CycleRecord;
use std::io::Write;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("не удалось сериализовать запись: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("поток вывода недоступен: {0}")]
    Write(#[from] std::io::Error),
}

impl SinkError {
    /// A broken output stream cannot be recovered from.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Write(_))
    }
}

/// Line-delimited JSON output. Each record goes out as one `write_all` of a
/// complete line followed by a flush.
pub struct LineSink<W: Write> {
    out: W,
}

impl<W: Write> LineSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn write_record(&mut self, record: &CycleRecord) -> Result<(), SinkError> {
        let line = record.to_json_line()?;
        self.out.write_all(&line)?;
        self.out.flush()?;
        Ok(())
    }

    #[cfg(test)]
    pub fn get_ref(&self) -> &W {
        &self.out
    }
}

pub struct Publisher<W: Write> {
    stream: LineSink<W>,
    gauges: Option<Arc<Metrics>>,
}

impl<W: Write> Publisher<W> {
    pub fn new(stream: LineSink<W>, gauges: Option<Arc<Metrics>>) -> Self {
        Self { stream, gauges }
    }

    /// Streams the record and, for successful ones, refreshes the gauges.
    pub fn publish(&mut self, record: &CycleRecord) -> Result<(), SinkError> {
        self.stream.write_record(record)?;
        if let Some(metrics) = &self.gauges {
            metrics.inc_cycle(record.is_failed());
            if !record.is_failed() {
                metrics.update_devices(record.devices());
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn stream(&self) -> &LineSink<W> {
        &self.stream
    }
}
