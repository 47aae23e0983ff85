//! Stream session manager for reader/writer handles.
//!
//! # Responsibility
//! - Register backing byte streams under reader/writer handles.
//! - Turn read/write/flush/close requests into blocking jobs.
//!
//! # Invariants
//! - Handle resolution happens on the caller path; only stream I/O runs on
//!   blocking workers.
//! - Every handle carries its own lock, so operations on one stream are
//!   serialized while different streams proceed in parallel.
//! - `close_*` releases the handle before the stream is closed, and the
//!   handle stays released whether or not the close itself fails.
//! - The stream owns its position; this layer never tracks offsets.

use crate::backend::{ReadStream, WriteStream};
use crate::error::{BackendResult, StructuredError};
use crate::handle::{Handle, HandleObject, HandleRegistry, OwnerReleased};
use log::{debug, warn};
use std::io::{ErrorKind, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Upper bound of the buffer behind one bounded read; larger requests are
/// served as short reads.
pub const MAX_READ_BYTES: usize = 1 << 20;

pub type SharedReader = Arc<Mutex<ReadStream>>;
pub type SharedWriter = Arc<Mutex<WriteStream>>;

pub fn share_reader(stream: ReadStream) -> SharedReader {
    Arc::new(Mutex::new(stream))
}

pub fn share_writer(stream: WriteStream) -> SharedWriter {
    Arc::new(Mutex::new(stream))
}

/// Result of one bounded read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadChunk {
    Data(Vec<u8>),
    EndOfStream,
}

/// Blocking stream job ready to be handed to a worker.
pub type StreamJob<T> = Box<dyn FnOnce() -> BackendResult<T> + Send>;

/// Reader/writer specialization of the handle registry.
#[derive(Clone)]
pub struct StreamSessions {
    registry: Arc<HandleRegistry>,
    read_chunk_bytes: usize,
}

impl StreamSessions {
    pub fn new(registry: Arc<HandleRegistry>, read_chunk_bytes: usize) -> Self {
        Self {
            registry,
            read_chunk_bytes: read_chunk_bytes.max(1),
        }
    }

    /// Registers a freshly opened reader owned by `owner`.
    pub fn open_reader(
        &self,
        stream: ReadStream,
        owner: Option<Handle>,
    ) -> Result<Handle, OwnerReleased> {
        self.register(HandleObject::Reader(share_reader(stream)), owner)
    }

    /// Registers a freshly opened writer owned by `owner`.
    pub fn open_writer(
        &self,
        stream: WriteStream,
        owner: Option<Handle>,
    ) -> Result<Handle, OwnerReleased> {
        self.register(HandleObject::Writer(share_writer(stream)), owner)
    }

    fn register(
        &self,
        object: HandleObject,
        owner: Option<Handle>,
    ) -> Result<Handle, OwnerReleased> {
        match owner {
            Some(owner) => self.registry.allocate_owned(object, owner),
            None => Ok(self.registry.allocate(object)),
        }
    }

    /// Reads at most `max_bytes` (capped at `MAX_READ_BYTES`) from the
    /// current stream position.
    pub fn read(
        &self,
        handle: Handle,
        max_bytes: usize,
    ) -> Result<StreamJob<ReadChunk>, StructuredError> {
        if max_bytes == 0 {
            return Err(StructuredError::invalid_argument(
                "read size must be greater than zero",
            ));
        }
        let reader = self.registry.resolve_reader(handle)?;
        Ok(Box::new(move || {
            let mut stream = lock_stream(&*reader);
            let mut buffer = vec![0_u8; max_bytes.min(MAX_READ_BYTES)];
            let read = read_retrying(&mut **stream, &mut buffer)?;
            if read == 0 {
                return Ok(ReadChunk::EndOfStream);
            }
            buffer.truncate(read);
            Ok(ReadChunk::Data(buffer))
        }))
    }

    /// Drains the stream with repeated bounded reads.
    pub fn read_all(&self, handle: Handle) -> Result<StreamJob<Vec<u8>>, StructuredError> {
        let reader = self.registry.resolve_reader(handle)?;
        let chunk_bytes = self.read_chunk_bytes;
        Ok(Box::new(move || {
            let mut stream = lock_stream(&*reader);
            let mut buffer = vec![0_u8; chunk_bytes];
            let mut output = Vec::new();
            loop {
                let read = read_retrying(&mut **stream, &mut buffer)?;
                if read == 0 {
                    break;
                }
                output.extend_from_slice(&buffer[..read]);
            }
            Ok(output)
        }))
    }

    pub fn write(&self, handle: Handle, data: Vec<u8>) -> Result<StreamJob<()>, StructuredError> {
        let writer = self.registry.resolve_writer(handle)?;
        Ok(Box::new(move || {
            lock_stream(&*writer).write_all(&data)?;
            Ok(())
        }))
    }

    pub fn flush(&self, handle: Handle) -> Result<StreamJob<()>, StructuredError> {
        let writer = self.registry.resolve_writer(handle)?;
        Ok(Box::new(move || {
            lock_stream(&*writer).flush()?;
            Ok(())
        }))
    }

    /// Releases a reader handle and closes the stream.
    pub fn close_reader(&self, handle: Handle) -> Result<StreamJob<()>, StructuredError> {
        let reader = self.registry.resolve_reader(handle)?;
        self.registry.release(handle)?;
        Ok(Box::new(move || {
            drop(reader);
            debug!(
                "event=stream_close module=stream status=ok kind=reader handle={}",
                handle
            );
            Ok(())
        }))
    }

    /// Releases a writer handle, then flushes and drops the stream.
    pub fn close_writer(&self, handle: Handle) -> Result<StreamJob<()>, StructuredError> {
        let writer = self.registry.resolve_writer(handle)?;
        self.registry.release(handle)?;
        Ok(Box::new(move || {
            let flushed = lock_stream(&*writer).flush();
            drop(writer);
            match flushed {
                Ok(()) => {
                    debug!(
                        "event=stream_close module=stream status=ok kind=writer handle={}",
                        handle
                    );
                    Ok(())
                }
                Err(err) => {
                    warn!(
                        "event=stream_close module=stream status=error kind=writer handle={} error={}",
                        handle, err
                    );
                    Err(err.into())
                }
            }
        }))
    }
}

fn lock_stream<T: ?Sized>(stream: &Mutex<Box<T>>) -> MutexGuard<'_, Box<T>> {
    stream.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_retrying(stream: &mut (dyn Read + Send), buffer: &mut [u8]) -> std::io::Result<usize> {
    loop {
        match stream.read(buffer) {
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ReadChunk, StreamSessions, MAX_READ_BYTES};
    use crate::error::ErrorCode;
    use crate::handle::HandleRegistry;
    use std::collections::VecDeque;
    use std::io::{Cursor, Read};
    use std::sync::Arc;

    /// Yields scripted chunk sizes regardless of the caller buffer size.
    struct ChunkedReader {
        chunks: VecDeque<Vec<u8>>,
    }

    impl Read for ChunkedReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    let len = chunk.len().min(buf.len());
                    buf[..len].copy_from_slice(&chunk[..len]);
                    Ok(len)
                }
                None => Ok(0),
            }
        }
    }

    fn sessions() -> StreamSessions {
        StreamSessions::new(Arc::new(HandleRegistry::new()), 1024)
    }

    #[test]
    fn read_all_concatenates_chunks_until_eof() {
        let sessions = sessions();
        let reader = ChunkedReader {
            chunks: VecDeque::from(vec![b"hello".to_vec(), b"abc".to_vec()]),
        };
        let handle = sessions.open_reader(Box::new(reader), None).unwrap();

        let bytes = sessions.read_all(handle).expect("resolve")().expect("read all");
        assert_eq!(bytes, b"helloabc".to_vec());
        assert_eq!(bytes.len(), 8);
    }

    #[test]
    fn bounded_read_reports_end_of_stream() {
        let sessions = sessions();
        let handle = sessions
            .open_reader(Box::new(Cursor::new(b"abcdef".to_vec())), None)
            .unwrap();

        let first = sessions.read(handle, 4).expect("resolve")().expect("read");
        assert_eq!(first, ReadChunk::Data(b"abcd".to_vec()));
        let second = sessions.read(handle, 4).expect("resolve")().expect("read");
        assert_eq!(second, ReadChunk::Data(b"ef".to_vec()));
        let third = sessions.read(handle, 4).expect("resolve")().expect("read");
        assert_eq!(third, ReadChunk::EndOfStream);
    }

    #[test]
    fn oversized_read_is_served_as_short_read() {
        let sessions = sessions();
        let handle = sessions
            .open_reader(Box::new(Cursor::new(b"abc".to_vec())), None)
            .unwrap();

        let chunk = sessions.read(handle, usize::MAX).expect("resolve")().expect("read");
        assert_eq!(chunk, ReadChunk::Data(b"abc".to_vec()));

        let big = vec![7_u8; MAX_READ_BYTES + 10];
        let handle = sessions.open_reader(Box::new(Cursor::new(big)), None).unwrap();
        let first = sessions.read(handle, 1 << 62).expect("resolve")().expect("read");
        assert_eq!(first, ReadChunk::Data(vec![7_u8; MAX_READ_BYTES]));
        let rest = sessions.read(handle, 1 << 62).expect("resolve")().expect("read");
        assert_eq!(rest, ReadChunk::Data(vec![7_u8; 10]));
    }

    #[test]
    fn opening_under_a_released_owner_is_refused() {
        let registry = Arc::new(HandleRegistry::new());
        let sessions = StreamSessions::new(Arc::clone(&registry), 1024);
        let owner = sessions
            .open_writer(Box::new(Vec::<u8>::new()), None)
            .unwrap();
        registry.release_tree(owner);

        let refused = sessions
            .open_reader(Box::new(Cursor::new(b"x".to_vec())), Some(owner))
            .err()
            .expect("owner released");
        assert_eq!(refused.error().code, ErrorCode::HandleNotFound);
        assert!(registry.is_empty());
    }

    #[test]
    fn zero_sized_read_is_rejected() {
        let sessions = sessions();
        let handle = sessions
            .open_reader(Box::new(Cursor::new(Vec::new())), None)
            .unwrap();
        let err = sessions.read(handle, 0).err().expect("zero read rejected");
        assert_eq!(err.code, ErrorCode::InvalidArgument);
    }

    #[test]
    fn closing_reader_twice_reports_handle_not_found() {
        let sessions = sessions();
        let handle = sessions
            .open_reader(Box::new(Cursor::new(b"x".to_vec())), None)
            .unwrap();

        sessions.close_reader(handle).expect("first close")().expect("close");
        let err = sessions.close_reader(handle).err().expect("second close fails");
        assert_eq!(err.code, ErrorCode::HandleNotFound);
        let err = sessions.read(handle, 1).err().expect("read after close fails");
        assert_eq!(err.code, ErrorCode::HandleNotFound);
    }

    #[test]
    fn writer_handle_cannot_be_read() {
        let sessions = sessions();
        let handle = sessions
            .open_writer(Box::new(Vec::<u8>::new()), None)
            .unwrap();
        let err = sessions.read_all(handle).err().expect("kind mismatch");
        assert_eq!(err.code, ErrorCode::HandleNotFound);
    }
}
