//! Request body buffering.
//!
//! Bodies at or below `post_buffering` stay in memory; larger ones spill
//! into an unlinked temporary file. Handlers read the finished body
//! through [`BodyReader`], which always starts at offset zero.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

/// A finished request body, rewound and ready to read.
pub enum BodyReader {
    /// No body was sent.
    Empty,
    /// Body buffered in memory.
    Memory(Cursor<Vec<u8>>),
    /// Body spooled to an unlinked temporary file.
    Spooled { file: File, len: u64 },
}

impl BodyReader {
    /// Total size of the body, when known.
    pub fn size(&self) -> Option<u64> {
        match self {
            BodyReader::Empty => Some(0),
            BodyReader::Memory(buf) => Some(buf.get_ref().len() as u64),
            BodyReader::Spooled { len, .. } => Some(*len),
        }
    }

    /// Seeks back to the start of the body.
    pub fn rewind(&mut self) -> io::Result<()> {
        match self {
            BodyReader::Empty => Ok(()),
            BodyReader::Memory(buf) => {
                buf.set_position(0);
                Ok(())
            }
            BodyReader::Spooled { file, .. } => file.seek(SeekFrom::Start(0)).map(|_| ()),
        }
    }

    /// Reads the whole body into a `Vec`. Test and small-handler helper.
    pub fn into_bytes(mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.size().unwrap_or(0) as usize);
        self.read_to_end(&mut out)?;
        Ok(out)
    }
}

impl Read for BodyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            BodyReader::Empty => Ok(0),
            BodyReader::Memory(cur) => cur.read(buf),
            BodyReader::Spooled { file, .. } => file.read(buf),
        }
    }
}

impl std::fmt::Debug for BodyReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BodyReader::Empty => f.write_str("BodyReader::Empty"),
            BodyReader::Memory(buf) => f
                .debug_struct("BodyReader::Memory")
                .field("len", &buf.get_ref().len())
                .finish(),
            BodyReader::Spooled { len, .. } => f
                .debug_struct("BodyReader::Spooled")
                .field("len", len)
                .finish(),
        }
    }
}

/// Accumulates an incoming body, spilling to disk past the threshold.
pub(crate) struct BodySink {
    inner: SinkInner,
    written: u64,
}

enum SinkInner {
    Memory(Vec<u8>),
    Spooled(File),
}

impl BodySink {
    /// `content_length` is the declared length (`-1` when unknown);
    /// `post_buffering` is the in-memory ceiling in bytes.
    pub(crate) fn new(content_length: i64, post_buffering: u64) -> io::Result<BodySink> {
        let inner = if content_length >= 0 && content_length as u64 > post_buffering {
            SinkInner::Spooled(tempfile::tempfile()?)
        } else {
            let cap = if content_length > 0 {
                content_length as usize
            } else {
                0
            };
            SinkInner::Memory(Vec::with_capacity(cap))
        };
        Ok(BodySink { inner, written: 0 })
    }

    pub(crate) fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match &mut self.inner {
            SinkInner::Memory(buf) => buf.extend_from_slice(data),
            SinkInner::Spooled(file) => file.write_all(data)?,
        }
        self.written += data.len() as u64;
        Ok(())
    }

    pub(crate) fn len(&self) -> u64 {
        self.written
    }

    pub(crate) fn finish(self) -> io::Result<BodyReader> {
        match self.inner {
            SinkInner::Memory(buf) if buf.is_empty() => Ok(BodyReader::Empty),
            SinkInner::Memory(buf) => Ok(BodyReader::Memory(Cursor::new(buf))),
            SinkInner::Spooled(mut file) => {
                file.seek(SeekFrom::Start(0))?;
                Ok(BodyReader::Spooled {
                    file,
                    len: self.written,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_body_stays_in_memory() {
        let mut sink = BodySink::new(5, 4096).unwrap();
        sink.write(b"hello").unwrap();
        assert_eq!(sink.len(), 5);
        let reader = sink.finish().unwrap();
        assert!(matches!(reader, BodyReader::Memory(_)));
        assert_eq!(reader.size(), Some(5));
        assert_eq!(reader.into_bytes().unwrap(), b"hello");
    }

    #[test]
    fn large_body_spools_to_disk() {
        let mut sink = BodySink::new(10, 4).unwrap();
        sink.write(b"hello").unwrap();
        sink.write(b"world").unwrap();
        let mut reader = sink.finish().unwrap();
        assert!(matches!(reader, BodyReader::Spooled { .. }));
        assert_eq!(reader.size(), Some(10));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"helloworld");

        reader.rewind().unwrap();
        let mut again = Vec::new();
        reader.read_to_end(&mut again).unwrap();
        assert_eq!(again, b"helloworld");
    }

    #[test]
    fn empty_body() {
        let sink = BodySink::new(0, 4096).unwrap();
        let reader = sink.finish().unwrap();
        assert!(matches!(reader, BodyReader::Empty));
        assert_eq!(reader.size(), Some(0));
    }
}
