//! Wire format for incremental snapshot streams.
//!
//! A stream is a fixed preamble, a JSON header naming the volume and the base
//! snapshot, then one frame per snapshot and a closing end tag:
//!
//! ```text
//! "FERRYSTR" | version u8
//! u32 length | header JSON
//! ( 0x01 | u32 length | frame JSON | file contents in frame order )*
//! 0x00
//! ```
//!
//! Lengths are big-endian. Each frame lists the files removed since the
//! previous snapshot and the files added or changed, whose contents follow
//! the frame header back to back.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, Take};

use super::{SnapshotId, VolumeName};

pub(crate) const MAGIC: &[u8; 8] = b"FERRYSTR";
pub(crate) const VERSION: u8 = 1;
const TAG_END: u8 = 0;
const TAG_SNAPSHOT: u8 = 1;
const MAX_HEADER_LEN: u32 = 16 * 1024 * 1024;
const COPY_CHUNK: usize = 64 * 1024;

/// Byte sink a stream is serialised into.
pub type StreamSink<'a> = &'a mut (dyn AsyncWrite + Send + Unpin);

/// Byte source a stream is read from.
pub type StreamSource<'a> = &'a mut (dyn AsyncRead + Send + Unpin);

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub(crate) struct StreamHeader {
    pub(crate) volume: VolumeName,
    pub(crate) base: Option<SnapshotId>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub(crate) struct FrameHeader {
    pub(crate) snapshot: SnapshotId,
    pub(crate) removed: Vec<String>,
    pub(crate) files: Vec<FileEntry>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub(crate) struct FileEntry {
    pub(crate) path: String,
    pub(crate) size: u64,
    pub(crate) digest: String,
}

/// Reasons a stream could not be decoded.
#[derive(Debug, Error)]
pub(crate) enum DecodeError {
    #[error("stream ended early")]
    Truncated,
    #[error("not a snapshot stream")]
    BadMagic,
    #[error("unsupported stream version {0}")]
    Version(u8),
    #[error("unknown record tag {0}")]
    Tag(u8),
    #[error("record of {0} bytes exceeds the header limit")]
    Oversized(u32),
    #[error("malformed record: {0}")]
    Json(#[from] serde_json::Error),
    #[error("read failed: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for DecodeError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::Truncated
        } else {
            Self::Io(err)
        }
    }
}

/// Side of a content copy that failed.
#[derive(Debug)]
pub(crate) enum CopyError {
    Source(std::io::Error),
    Sink(std::io::Error),
}

/// Writes stream records into a sink, counting the bytes written.
pub(crate) struct StreamWriter<'a> {
    sink: StreamSink<'a>,
    written: u64,
}

impl<'a> StreamWriter<'a> {
    pub(crate) async fn begin(
        sink: StreamSink<'a>,
        header: &StreamHeader,
    ) -> std::io::Result<Self> {
        let mut writer = Self { sink, written: 0 };
        writer.write(MAGIC).await?;
        writer.write(&[VERSION]).await?;
        writer.record(header).await?;
        Ok(writer)
    }

    pub(crate) async fn frame(&mut self, frame: &FrameHeader) -> std::io::Result<()> {
        self.write(&[TAG_SNAPSHOT]).await?;
        self.record(frame).await
    }

    /// Copies exactly `size` bytes of file content from `reader`.
    pub(crate) async fn content<R>(&mut self, reader: &mut R, size: u64) -> Result<(), CopyError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut limited = reader.take(size);
        let mut buffer = vec![0_u8; COPY_CHUNK];
        let mut copied = 0_u64;
        loop {
            let read = limited.read(&mut buffer).await.map_err(CopyError::Source)?;
            if read == 0 {
                break;
            }
            let chunk = buffer.get(..read).unwrap_or_default();
            self.sink.write_all(chunk).await.map_err(CopyError::Sink)?;
            copied += read as u64;
        }
        if copied != size {
            return Err(CopyError::Source(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("file shrank while streaming: expected {size} bytes, read {copied}"),
            )));
        }
        self.written += copied;
        Ok(())
    }

    pub(crate) async fn finish(mut self) -> std::io::Result<u64> {
        self.write(&[TAG_END]).await?;
        self.sink.flush().await?;
        Ok(self.written)
    }

    async fn record<T: Serialize>(&mut self, value: &T) -> std::io::Result<()> {
        let encoded = serde_json::to_vec(value)?;
        let len = u32::try_from(encoded.len()).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "stream record exceeds u32 length",
            )
        })?;
        self.sink.write_u32(len).await?;
        self.written += 4;
        self.write(&encoded).await
    }

    async fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.sink.write_all(bytes).await?;
        self.written += bytes.len() as u64;
        Ok(())
    }
}

/// Records decoded after the stream header.
#[derive(Debug)]
pub(crate) enum Record {
    Snapshot(FrameHeader),
    End,
}

/// Reads stream records from a source.
pub(crate) struct StreamReader<'a> {
    source: StreamSource<'a>,
}

impl<'a> StreamReader<'a> {
    pub(crate) async fn begin(
        source: StreamSource<'a>,
    ) -> Result<(Self, StreamHeader), DecodeError> {
        let mut reader = Self { source };
        let mut magic = [0_u8; 8];
        reader.source.read_exact(&mut magic).await?;
        if &magic != MAGIC {
            return Err(DecodeError::BadMagic);
        }
        let version = reader.source.read_u8().await?;
        if version != VERSION {
            return Err(DecodeError::Version(version));
        }
        let header = reader.record().await?;
        Ok((reader, header))
    }

    pub(crate) async fn next(&mut self) -> Result<Record, DecodeError> {
        match self.source.read_u8().await? {
            TAG_END => Ok(Record::End),
            TAG_SNAPSHOT => Ok(Record::Snapshot(self.record().await?)),
            other => Err(DecodeError::Tag(other)),
        }
    }

    /// Borrows the next `size` bytes of file content.
    pub(crate) fn content(&mut self, size: u64) -> Take<&mut (dyn AsyncRead + Send + Unpin + 'a)> {
        (&mut *self.source).take(size)
    }

    async fn record<T: DeserializeOwned>(&mut self) -> Result<T, DecodeError> {
        let len = self.source.read_u32().await?;
        if len > MAX_HEADER_LEN {
            return Err(DecodeError::Oversized(len));
        }
        let mut buffer = vec![0_u8; len as usize];
        self.source.read_exact(&mut buffer).await?;
        Ok(serde_json::from_slice(&buffer)?)
    }
}

/// Writes a stream that carries no snapshots.
///
/// Applying it creates the filesystem when absent and is otherwise a no-op,
/// which lets a filesystem without history be replicated.
pub(crate) async fn write_empty(
    sink: StreamSink<'_>,
    volume: &VolumeName,
    base: Option<&SnapshotId>,
) -> std::io::Result<u64> {
    let header = StreamHeader {
        volume: volume.clone(),
        base: base.cloned(),
    };
    StreamWriter::begin(sink, &header).await?.finish().await
}
