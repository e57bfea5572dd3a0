//! Frame codec: one wire-level frame in, one wire-level frame out.
//!
//! ### Frame layout (RFC 6455 §5.2)
//!
//! ```txt
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```

use crate::error::{Error, Result};
use crate::mask::apply_mask;
use crate::pool::{BufferPool, Unpooled};
use crate::proto::{Opcode, MAX_CONTROL_PAYLOAD, MAX_HEADER_SIZE};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A parsed wire frame.
///
/// `payload` borrows the reader's scratch buffer (or the caller's buffer for
/// [`FrameReader::read_frame_into`]) and is only valid until the next read
/// on the same reader; copy it out to retain it.
#[derive(Debug)]
pub struct Frame<'a> {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: Opcode,
    pub masked: bool,
    /// Meaningful iff `masked`.
    pub mask_key: [u8; 4],
    pub payload: &'a [u8],
}

impl Frame<'_> {
    #[inline]
    pub fn is_control(&self) -> bool {
        self.opcode.is_control()
    }
}

/// Decoded header, before the payload is read.
struct Header {
    fin: bool,
    opcode: Opcode,
    masked: bool,
    mask_key: [u8; 4],
    len: u64,
}

impl Header {
    fn into_frame(self, payload: &[u8]) -> Frame<'_> {
        Frame {
            fin: self.fin,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode: self.opcode,
            masked: self.masked,
            mask_key: self.mask_key,
            payload,
        }
    }
}

#[inline]
async fn read_array<const N: usize, R>(stream: &mut R) -> std::io::Result<[u8; N]>
where
    R: Unpin + AsyncRead,
{
    let mut buf = [0; N];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Reads frames from a byte stream into a retained scratch buffer.
///
/// The scratch buffer is drawn from the injected [`BufferPool`] at
/// construction, grows to the high-water mark of observed payloads, never
/// shrinks, and is handed back to the pool on drop. Steady-state traffic at
/// or below that mark reads with zero allocation.
pub struct FrameReader<R> {
    reader: R,
    scratch: Vec<u8>,
    pool: Arc<dyn BufferPool>,
}

const INITIAL_SCRATCH: usize = 4096;

impl<R: Unpin + AsyncRead> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_pool(reader, Arc::new(Unpooled))
    }

    pub fn with_pool(reader: R, pool: Arc<dyn BufferPool>) -> Self {
        let scratch = pool.get(INITIAL_SCRATCH);
        Self {
            reader,
            scratch,
            pool,
        }
    }

    /// Reads and validates the fixed header, extended length and mask key.
    ///
    /// Legality checks run on the first two bytes alone, before any further
    /// I/O: reserved opcodes, RSV bits, fragmented control frames and
    /// control frames announcing more than 125 payload bytes are rejected
    /// without touching the stream again.
    async fn read_header(&mut self) -> Result<Header> {
        let [b0, b1] = read_array(&mut self.reader).await?;

        let fin = b0 & 0x80 != 0;
        let rsv = b0 & 0x70;
        let opcode = Opcode::from_u4(b0 & 0x0F).ok_or(Error::InvalidOpcode)?;

        let masked = b1 & 0x80 != 0;
        let len7 = b1 & 0x7F;

        if rsv != 0 {
            return Err(Error::ReservedBitsSet);
        }
        if opcode.is_control() {
            if !fin {
                return Err(Error::FragmentedControl);
            }
            if len7 as usize > MAX_CONTROL_PAYLOAD {
                return Err(Error::InvalidControlFrame);
            }
        }

        let len = match len7 {
            126 => u16::from_be_bytes(read_array(&mut self.reader).await?) as u64,
            127 => {
                let len = u64::from_be_bytes(read_array(&mut self.reader).await?);
                // RFC 6455: the most significant bit of the 64-bit form
                // must be 0.
                if len & (1 << 63) != 0 {
                    return Err(Error::FrameTooLarge);
                }
                len
            }
            n => n as u64,
        };

        let mask_key = if masked {
            read_array(&mut self.reader).await?
        } else {
            [0; 4]
        };

        tracing::trace!(opcode = ?opcode, len, masked, "frame header");
        Ok(Header {
            fin,
            opcode,
            masked,
            mask_key,
            len,
        })
    }

    /// Reads the next frame into the internal scratch buffer.
    ///
    /// The returned frame's payload aliases that buffer and is invalidated
    /// by the next read on this reader.
    pub async fn read_frame(&mut self) -> Result<Frame<'_>> {
        let head = self.read_header().await?;
        let len = usize::try_from(head.len).map_err(|_| Error::FrameTooLarge)?;

        if self.scratch.len() < len {
            self.scratch.resize(len, 0);
        }
        let payload = &mut self.scratch[..len];
        self.reader.read_exact(payload).await?;
        if head.masked {
            apply_mask(payload, head.mask_key);
        }
        Ok(head.into_frame(&self.scratch[..len]))
    }

    /// Reads the next frame into `buf`, allocating nothing.
    ///
    /// Fails with [`Error::FrameTooLarge`] when `buf` is smaller than the
    /// announced payload length.
    pub async fn read_frame_into<'b>(&mut self, buf: &'b mut [u8]) -> Result<Frame<'b>> {
        let head = self.read_header().await?;
        let len = usize::try_from(head.len).map_err(|_| Error::FrameTooLarge)?;

        if buf.len() < len {
            return Err(Error::FrameTooLarge);
        }
        let payload = &mut buf[..len];
        self.reader.read_exact(payload).await?;
        if head.masked {
            apply_mask(payload, head.mask_key);
        }
        Ok(head.into_frame(&buf[..len]))
    }
}

impl<R> Drop for FrameReader<R> {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.scratch));
    }
}

/// Writes frames to a byte stream. The header is assembled in a fixed stack
/// buffer; nothing is heap-allocated on the write path.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: Unpin + AsyncWrite> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Writes one frame: header, then payload, as two sequential writes.
    ///
    /// When `mask_key` is `Some`, `payload` is masked **in place** before it
    /// hits the wire — the caller's buffer is mutated.
    pub async fn write_frame(
        &mut self,
        opcode: Opcode,
        fin: bool,
        payload: &mut [u8],
        mask_key: Option<[u8; 4]>,
    ) -> Result<()> {
        let mut head = [0u8; MAX_HEADER_SIZE];
        head[0] = ((fin as u8) << 7) | opcode as u8;

        let mask_bit = if mask_key.is_some() { 0x80 } else { 0 };
        let len = payload.len();
        let mut n = if len <= 125 {
            head[1] = mask_bit | len as u8;
            2
        } else if len <= 0xFFFF {
            head[1] = mask_bit | 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = mask_bit | 127;
            head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            10
        };

        if let Some(key) = mask_key {
            head[n..n + 4].copy_from_slice(&key);
            n += 4;
            apply_mask(payload, key);
        }

        self.writer.write_all(&head[..n]).await?;
        self.writer.write_all(payload).await?;
        Ok(())
    }

    /// Writes a control frame, enforcing FIN=1 and the 125-byte payload cap.
    pub async fn write_control(
        &mut self,
        opcode: Opcode,
        payload: &mut [u8],
        mask_key: Option<[u8; 4]>,
    ) -> Result<()> {
        if !opcode.is_control() {
            return Err(Error::InvalidOpcode);
        }
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(Error::InvalidControlFrame);
        }
        self.write_frame(opcode, true, payload, mask_key).await
    }

    pub async fn write_ping(&mut self, payload: &mut [u8], mask_key: Option<[u8; 4]>) -> Result<()> {
        self.write_control(Opcode::Ping, payload, mask_key).await
    }

    pub async fn write_pong(&mut self, payload: &mut [u8], mask_key: Option<[u8; 4]>) -> Result<()> {
        self.write_control(Opcode::Pong, payload, mask_key).await
    }

    /// Writes a Close frame with a big-endian status code and UTF-8 reason.
    /// The reason must leave the total control payload within 125 bytes.
    pub async fn write_close(
        &mut self,
        code: u16,
        reason: &str,
        mask_key: Option<[u8; 4]>,
    ) -> Result<()> {
        if 2 + reason.len() > MAX_CONTROL_PAYLOAD {
            return Err(Error::InvalidControlFrame);
        }
        let mut buf = [0u8; MAX_CONTROL_PAYLOAD];
        buf[..2].copy_from_slice(&code.to_be_bytes());
        buf[2..2 + reason.len()].copy_from_slice(reason.as_bytes());
        self.write_control(Opcode::Close, &mut buf[..2 + reason.len()], mask_key)
            .await
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
