//! Reader/writer entry points. Stream bytes cross the caller boundary as
//! standard base64 strings.

use super::{parse_handle, HiveBridge};
use crate::completion::ReplySink;
use crate::error::StructuredError;
use crate::stream::{ReadChunk, StreamJob};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::Value;

impl HiveBridge {
    pub fn writer_write(&self, writer_id: &str, data: Vec<u8>, reply: ReplySink) {
        self.stream_call(
            "writer_write",
            parse_handle(writer_id).and_then(|handle| self.streams.write(handle, data)),
            |()| Value::Null,
            reply,
        );
    }

    pub fn writer_flush(&self, writer_id: &str, reply: ReplySink) {
        self.stream_call(
            "writer_flush",
            parse_handle(writer_id).and_then(|handle| self.streams.flush(handle)),
            |()| Value::Null,
            reply,
        );
    }

    /// The writer handle is released even when the final flush fails.
    pub fn writer_close(&self, writer_id: &str, reply: ReplySink) {
        self.stream_call(
            "writer_close",
            parse_handle(writer_id).and_then(|handle| self.streams.close_writer(handle)),
            |()| Value::Null,
            reply,
        );
    }

    /// Replies up to `max_bytes` as base64, or `null` at end of stream.
    pub fn reader_read(&self, reader_id: &str, max_bytes: i64, reply: ReplySink) {
        let job = parse_handle(reader_id).and_then(|handle| {
            let max_bytes = usize::try_from(max_bytes).map_err(|_| {
                StructuredError::invalid_argument(format!(
                    "read size must be a positive byte count, got {max_bytes}"
                ))
            })?;
            self.streams.read(handle, max_bytes)
        });
        self.stream_call(
            "reader_read",
            job,
            |chunk| match chunk {
                ReadChunk::Data(bytes) => Value::String(STANDARD.encode(bytes)),
                ReadChunk::EndOfStream => Value::Null,
            },
            reply,
        );
    }

    /// Replies the rest of the stream as one base64 string.
    pub fn reader_read_all(&self, reader_id: &str, reply: ReplySink) {
        self.stream_call(
            "reader_readAll",
            parse_handle(reader_id).and_then(|handle| self.streams.read_all(handle)),
            |bytes| Value::String(STANDARD.encode(bytes)),
            reply,
        );
    }

    pub fn reader_close(&self, reader_id: &str, reply: ReplySink) {
        self.stream_call(
            "reader_close",
            parse_handle(reader_id).and_then(|handle| self.streams.close_reader(handle)),
            |()| Value::Null,
            reply,
        );
    }

    fn stream_call<T: Send + 'static>(
        &self,
        action: &'static str,
        job: Result<StreamJob<T>, StructuredError>,
        project: impl FnOnce(T) -> Value + Send + 'static,
        reply: ReplySink,
    ) {
        match job {
            Ok(job) => self
                .completion
                .complete_blocking(action, job, project, reply),
            Err(err) => self.completion.reject(action, err, reply),
        }
    }
}
