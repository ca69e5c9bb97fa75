//! Framed message stream.
//!
//! Every message is written as a one-byte kind, a little-endian `u32` payload
//! length and a bincode payload. A stream starts out raw; after
//! [`WireWriter::compress`] / [`WireReader::decompress`] every following byte
//! passes through the chosen codec.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::io::{self, BufRead, BufWriter, ErrorKind, Read, Write};
use tracing::{trace, warn};

use crate::container::Container;
use crate::error::{PatchError, Result};
use crate::patch_format::{
    BsdiffHeader, CompressionAlgorithm, CompressionSettings, PatchHeader, SyncHeader, SyncOp,
    MAX_MESSAGE_SIZE,
};

const BROTLI_BUFFER_SIZE: usize = 64 * 1024;
const BROTLI_WINDOW_BITS: u32 = 22;
const WRITE_BUFFER_SIZE: usize = 256 * 1024;

/// Discriminant written in front of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    PatchHeader = 1,
    Container = 2,
    SyncHeader = 3,
    BsdiffHeader = 4,
    SyncOp = 5,
}

impl MessageKind {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(MessageKind::PatchHeader),
            2 => Some(MessageKind::Container),
            3 => Some(MessageKind::SyncHeader),
            4 => Some(MessageKind::BsdiffHeader),
            5 => Some(MessageKind::SyncOp),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::PatchHeader => "patch header",
            MessageKind::Container => "container",
            MessageKind::SyncHeader => "sync header",
            MessageKind::BsdiffHeader => "bsdiff header",
            MessageKind::SyncOp => "sync op",
        };
        f.write_str(name)
    }
}

/// Any message that can appear in a patch stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    PatchHeader(PatchHeader),
    Container(Container),
    SyncHeader(SyncHeader),
    BsdiffHeader(BsdiffHeader),
    SyncOp(SyncOp),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::PatchHeader(_) => MessageKind::PatchHeader,
            Message::Container(_) => MessageKind::Container,
            Message::SyncHeader(_) => MessageKind::SyncHeader,
            Message::BsdiffHeader(_) => MessageKind::BsdiffHeader,
            Message::SyncOp(_) => MessageKind::SyncOp,
        }
    }
}

/// A concrete message type with a fixed frame discriminant.
pub trait WireMessage: Serialize + DeserializeOwned + Into<Message> {
    const KIND: MessageKind;

    /// Unwrap the matching variant, handing the message back if it is another kind.
    fn from_message(msg: Message) -> std::result::Result<Self, Message>;
}

macro_rules! wire_message {
    ($ty:ty, $variant:ident) => {
        impl WireMessage for $ty {
            const KIND: MessageKind = MessageKind::$variant;

            fn from_message(msg: Message) -> std::result::Result<Self, Message> {
                match msg {
                    Message::$variant(inner) => Ok(inner),
                    other => Err(other),
                }
            }
        }

        impl From<$ty> for Message {
            fn from(inner: $ty) -> Self {
                Message::$variant(inner)
            }
        }
    };
}

wire_message!(PatchHeader, PatchHeader);
wire_message!(Container, Container);
wire_message!(SyncHeader, SyncHeader);
wire_message!(BsdiffHeader, BsdiffHeader);
wire_message!(SyncOp, SyncOp);

enum CodecWriter<W: Write> {
    Plain(W),
    Brotli(Box<brotli::CompressorWriter<W>>),
    Zstd(zstd::Encoder<'static, W>),
}

impl<W: Write> CodecWriter<W> {
    fn wrap(inner: W, settings: &CompressionSettings) -> io::Result<Self> {
        Ok(match settings.algorithm {
            CompressionAlgorithm::None => CodecWriter::Plain(inner),
            CompressionAlgorithm::Brotli => {
                let quality = settings.quality.clamp(0, 11) as u32;
                CodecWriter::Brotli(Box::new(brotli::CompressorWriter::new(
                    inner,
                    BROTLI_BUFFER_SIZE,
                    quality,
                    BROTLI_WINDOW_BITS,
                )))
            }
            CompressionAlgorithm::Zstd => {
                CodecWriter::Zstd(zstd::Encoder::new(inner, settings.quality)?)
            }
        })
    }

    /// Write the final compressed frame and hand back the inner sink.
    fn finish(self) -> io::Result<W> {
        match self {
            CodecWriter::Plain(w) => Ok(w),
            CodecWriter::Brotli(mut w) => {
                // into_inner swallows write errors from the final block.
                w.flush()?;
                Ok(w.into_inner())
            }
            CodecWriter::Zstd(w) => w.finish(),
        }
    }
}

impl<W: Write> Write for CodecWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            CodecWriter::Plain(w) => w.write(buf),
            CodecWriter::Brotli(w) => w.write(buf),
            CodecWriter::Zstd(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            CodecWriter::Plain(w) => w.flush(),
            CodecWriter::Brotli(w) => w.flush(),
            CodecWriter::Zstd(w) => w.flush(),
        }
    }
}

/// Writes framed messages to a byte sink.
///
/// Output is buffered: [`WireWriter::finish`] must be called to flush the
/// final compressed frame. A writer dropped without finishing leaves a
/// truncated stream behind.
pub struct WireWriter<W: Write> {
    sink: Option<CodecWriter<BufWriter<W>>>,
    compressed: bool,
    scratch: Vec<u8>,
}

impl<W: Write> WireWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            sink: Some(CodecWriter::Plain(BufWriter::with_capacity(
                WRITE_BUFFER_SIZE,
                inner,
            ))),
            compressed: false,
            scratch: Vec::new(),
        }
    }

    fn sink(&mut self) -> io::Result<&mut CodecWriter<BufWriter<W>>> {
        self.sink
            .as_mut()
            .ok_or_else(|| io::Error::other("wire writer already finished"))
    }

    pub fn write_magic(&mut self, magic: u32) -> Result<()> {
        self.sink()?.write_all(&magic.to_le_bytes())?;
        Ok(())
    }

    pub fn write_message<T: WireMessage>(&mut self, msg: &T) -> Result<()> {
        self.scratch.clear();
        bincode::serialize_into(&mut self.scratch, msg)
            .map_err(|e| PatchError::Encode(format!("{}: {}", T::KIND, e)))?;

        if self.scratch.len() > MAX_MESSAGE_SIZE {
            return Err(PatchError::Encode(format!(
                "{} of {} bytes exceeds the {} byte frame limit",
                T::KIND,
                self.scratch.len(),
                MAX_MESSAGE_SIZE
            )));
        }

        let kind = T::KIND;
        let len = self.scratch.len() as u32;
        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| io::Error::other("wire writer already finished"))?;
        sink.write_all(&[kind as u8])?;
        sink.write_all(&len.to_le_bytes())?;
        sink.write_all(&self.scratch)?;
        trace!(%kind, len, "wrote message");
        Ok(())
    }

    /// Route every subsequent write through the codec named by `settings`.
    pub fn compress(mut self, settings: &CompressionSettings) -> Result<Self> {
        if self.compressed {
            return Err(PatchError::format("wire stream is already compressed"));
        }
        let sink = match self.sink.take() {
            Some(CodecWriter::Plain(inner)) => inner,
            Some(other) => {
                self.sink = Some(other);
                return Err(PatchError::format("wire stream is already compressed"));
            }
            None => return Err(io::Error::other("wire writer already finished").into()),
        };
        self.sink = Some(CodecWriter::wrap(sink, settings)?);
        self.compressed = true;
        Ok(self)
    }

    /// Finalize the codec, flush all buffers and return the underlying sink.
    pub fn finish(mut self) -> Result<W> {
        let sink = self
            .sink
            .take()
            .ok_or_else(|| io::Error::other("wire writer already finished"))?;
        let mut buffered = sink.finish()?;
        buffered.flush()?;
        let inner = buffered.into_inner().map_err(|e| e.into_error())?;
        Ok(inner)
    }
}

impl<W: Write> Drop for WireWriter<W> {
    fn drop(&mut self) {
        if self.sink.is_some() && !std::thread::panicking() {
            warn!("wire writer dropped without finish; the stream is truncated");
        }
    }
}

enum CodecReader<R: BufRead> {
    Plain(R),
    Brotli(Box<brotli::Decompressor<R>>),
    Zstd(zstd::Decoder<'static, R>),
}

impl<R: BufRead> CodecReader<R> {
    fn wrap(inner: R, settings: &CompressionSettings) -> io::Result<Self> {
        Ok(match settings.algorithm {
            CompressionAlgorithm::None => CodecReader::Plain(inner),
            CompressionAlgorithm::Brotli => CodecReader::Brotli(Box::new(
                brotli::Decompressor::new(inner, BROTLI_BUFFER_SIZE),
            )),
            CompressionAlgorithm::Zstd => CodecReader::Zstd(zstd::Decoder::with_buffer(inner)?),
        })
    }
}

impl<R: BufRead> Read for CodecReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            CodecReader::Plain(r) => r.read(buf),
            CodecReader::Brotli(r) => r.read(buf),
            CodecReader::Zstd(r) => r.read(buf),
        }
    }
}

/// Reads framed messages from a byte source.
pub struct WireReader<R: BufRead> {
    source: CodecReader<R>,
    compressed: bool,
    buf: Vec<u8>,
}

fn truncated(err: io::Error, what: &str) -> PatchError {
    if err.kind() == ErrorKind::UnexpectedEof {
        PatchError::format(format!("truncated patch: unexpected end of stream in {}", what))
    } else {
        PatchError::Io(err)
    }
}

impl<R: BufRead> WireReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            source: CodecReader::Plain(inner),
            compressed: false,
            buf: Vec::new(),
        }
    }

    pub fn read_magic(&mut self, expected: u32) -> Result<()> {
        let mut bytes = [0u8; 4];
        self.source
            .read_exact(&mut bytes)
            .map_err(|e| truncated(e, "magic number"))?;
        let actual = u32::from_le_bytes(bytes);
        if actual != expected {
            return Err(PatchError::format(format!(
                "bad magic number: expected {:#010x}, got {:#010x}",
                expected, actual
            )));
        }
        Ok(())
    }

    /// Read one byte, returning `None` on a clean end of stream.
    fn read_tag(&mut self) -> Result<Option<u8>> {
        let mut tag = [0u8; 1];
        loop {
            match self.source.read(&mut tag) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(tag[0])),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(truncated(e, "message tag")),
            }
        }
    }

    /// Read the next message, or `None` if the stream ends at a frame boundary.
    pub fn try_read_message(&mut self) -> Result<Option<Message>> {
        let Some(tag) = self.read_tag()? else {
            return Ok(None);
        };
        let kind = MessageKind::from_u8(tag)
            .ok_or_else(|| PatchError::format(format!("unknown message tag {}", tag)))?;

        let mut len_bytes = [0u8; 4];
        self.source
            .read_exact(&mut len_bytes)
            .map_err(|e| truncated(e, "length prefix"))?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(PatchError::format(format!(
                "{} claims {} bytes, more than the {} byte limit",
                kind, len, MAX_MESSAGE_SIZE
            )));
        }

        self.buf.resize(len, 0);
        self.source
            .read_exact(&mut self.buf)
            .map_err(|e| truncated(e, "message payload"))?;
        trace!(%kind, len, "read message");

        let payload = &self.buf[..];
        Ok(Some(match kind {
            MessageKind::PatchHeader => Message::PatchHeader(decode(kind, payload)?),
            MessageKind::Container => Message::Container(decode(kind, payload)?),
            MessageKind::SyncHeader => Message::SyncHeader(decode(kind, payload)?),
            MessageKind::BsdiffHeader => Message::BsdiffHeader(decode(kind, payload)?),
            MessageKind::SyncOp => Message::SyncOp(decode(kind, payload)?),
        }))
    }

    /// Read the next message; end of stream is a format error.
    pub fn read_message(&mut self) -> Result<Message> {
        self.try_read_message()?.ok_or_else(|| {
            PatchError::format("truncated patch: stream ended before the terminator")
        })
    }

    /// Read the next message and require it to be a `T`.
    pub fn expect<T: WireMessage>(&mut self) -> Result<T> {
        let msg = self.read_message()?;
        T::from_message(msg).map_err(|other| {
            PatchError::format(format!("expected {}, found {}", T::KIND, other.kind()))
        })
    }

    /// Route every subsequent read through the codec named by `settings`.
    pub fn decompress(self, settings: &CompressionSettings) -> Result<Self> {
        let inner = match self.source {
            CodecReader::Plain(inner) if !self.compressed => inner,
            _ => return Err(PatchError::format("wire stream is already compressed")),
        };
        Ok(Self {
            source: CodecReader::wrap(inner, settings)?,
            compressed: true,
            buf: self.buf,
        })
    }

    /// True when no bytes remain. Consumes a byte if one is there.
    pub fn at_eof(&mut self) -> Result<bool> {
        Ok(self.read_tag()?.is_none())
    }
}

fn decode<T: DeserializeOwned>(kind: MessageKind, payload: &[u8]) -> Result<T> {
    bincode::deserialize(payload)
        .map_err(|e| PatchError::format(format!("malformed {}: {}", kind, e)))
}
