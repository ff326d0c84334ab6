//! Newline-delimited feed ingestion.
//!
//! A request body arrives as an arbitrary chunking of bytes. [`LineSplitter`]
//! reassembles lines across chunk boundaries without ever buffering more than
//! `max_line_bytes` of one line; [`Ingestor`] validates each line and appends
//! it to the run's stream in batches of `flush_every`, plus a final flush at
//! end of body.
//!
//! A bad line is counted and skipped. A log failure aborts the request.

use futures::{Stream, StreamExt};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::IngestConfig;
use crate::error::{EventError, Result};
use crate::event::{parse_line, stream_key};
use crate::retry::{RetryPolicy, with_retry};
use crate::stream_log::StreamLog;

/// Counts for one ingested body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub ingested: u64,
    pub rejected: u64,
}

/// Incremental splitter of a byte stream into text lines.
///
/// `\n` terminates a line and a trailing `\r` is stripped. Blank lines are
/// skipped. A line longer than the limit is discarded as it streams and
/// reported once, when it ends.
#[derive(Debug)]
pub struct LineSplitter {
    buf: Vec<u8>,
    line_len: usize,
    max: usize,
}

impl LineSplitter {
    #[must_use]
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            line_len: 0,
            max: max_line_bytes.max(1),
        }
    }

    /// Feed one chunk; completed lines are appended to `out`.
    pub fn push(&mut self, mut chunk: &[u8], out: &mut Vec<std::result::Result<String, EventError>>) {
        while !chunk.is_empty() {
            if let Some(pos) = chunk.iter().position(|b| *b == b'\n') {
                self.extend(&chunk[..pos]);
                self.end_line(out);
                chunk = &chunk[pos + 1..];
            } else {
                self.extend(chunk);
                break;
            }
        }
    }

    /// Flush an unterminated last line.
    pub fn finish(&mut self, out: &mut Vec<std::result::Result<String, EventError>>) {
        if self.line_len > 0 {
            self.end_line(out);
        }
    }

    fn extend(&mut self, part: &[u8]) {
        self.line_len += part.len();
        if self.line_len > self.max {
            self.buf.clear();
        } else {
            self.buf.extend_from_slice(part);
        }
    }

    fn end_line(&mut self, out: &mut Vec<std::result::Result<String, EventError>>) {
        let len = std::mem::take(&mut self.line_len);
        if len > self.max {
            self.buf.clear();
            out.push(Err(EventError::LineTooLong { len, max: self.max }));
            return;
        }
        let mut line = std::mem::take(&mut self.buf);
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            return;
        }
        out.push(String::from_utf8(line).map_err(|_| EventError::InvalidUtf8));
    }
}

/// Validates feed lines and appends them to per-run streams.
#[derive(Debug, Clone)]
pub struct Ingestor {
    log: StreamLog,
    prefix: String,
    flush_every: usize,
    max_line_bytes: usize,
    policy: RetryPolicy,
}

impl Ingestor {
    #[must_use]
    pub fn new(log: StreamLog, prefix: impl Into<String>, config: &IngestConfig) -> Self {
        Self {
            log,
            prefix: prefix.into(),
            flush_every: config.flush_every.max(1),
            max_line_bytes: config.max_line_bytes,
            policy: RetryPolicy::db_write(),
        }
    }

    /// Consume a whole body.
    ///
    /// Lines parsed before a body error are still flushed; the error is then
    /// returned as [`EventError::BodyInterrupted`].
    pub async fn ingest_stream<S, B, E>(&self, body: S) -> Result<IngestReport>
    where
        S: Stream<Item = std::result::Result<B, E>>,
        B: AsRef<[u8]>,
        E: std::fmt::Display,
    {
        let mut body = std::pin::pin!(body);
        let mut splitter = LineSplitter::new(self.max_line_bytes);
        let mut lines = Vec::new();
        let mut batch = Vec::with_capacity(self.flush_every);
        let mut report = IngestReport::default();

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    self.flush(&mut batch, &mut report).await?;
                    return Err(EventError::BodyInterrupted(e.to_string()).into());
                }
            };
            splitter.push(chunk.as_ref(), &mut lines);
            for line in lines.drain(..) {
                self.accept(line, &mut batch, &mut report);
                if batch.len() >= self.flush_every {
                    self.flush(&mut batch, &mut report).await?;
                }
            }
        }
        splitter.finish(&mut lines);
        for line in lines.drain(..) {
            self.accept(line, &mut batch, &mut report);
        }
        self.flush(&mut batch, &mut report).await?;
        debug!(
            target: "tracegraph.ingest",
            ingested = report.ingested,
            rejected = report.rejected,
            "body consumed"
        );
        Ok(report)
    }

    fn accept(
        &self,
        line: std::result::Result<String, EventError>,
        batch: &mut Vec<(String, String)>,
        report: &mut IngestReport,
    ) {
        let parsed = line.and_then(|text| parse_line(&text).map(|event| (event, text)));
        match parsed {
            Ok((event, text)) => {
                batch.push((stream_key(&self.prefix, &event.run_id), text));
            }
            Err(e) => {
                report.rejected += 1;
                warn!(target: "tracegraph.ingest", error = %e, "rejected feed line");
            }
        }
    }

    async fn flush(
        &self,
        batch: &mut Vec<(String, String)>,
        report: &mut IngestReport,
    ) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let entries = std::mem::take(batch);
        let ids = with_retry(&self.policy, || self.log.append_batch(entries.clone())).await?;
        report.ingested += ids.len() as u64;
        Ok(())
    }
}
