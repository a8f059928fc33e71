//! Streaming envelope codec
//!
//! [`Encoder`] writes `signature ‖ IV ‖ ciphertext` from one byte source into
//! one or more byte sinks; [`Decoder`] is the inverse. Both process the
//! stream in chunks and poll a cancellation token between chunks, so a
//! cancelled run stops at the next chunk boundary with whatever prefix was
//! already written. There is no rollback.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use xv_core::{Error, Result, Status};

use crate::bytes::{random_iv, CfbDec, CfbEnc};
use crate::kdf::MasterKey;
use crate::{DEFAULT_BUFFER_SIZE, IV_SIZE, SIGNATURE_SIZE};

/// A readable byte source feeding a cipher run.
pub type ByteSource = Box<dyn AsyncRead + Send + Unpin>;

/// A writable byte sink receiving cipher output.
pub type ByteSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Duplicates every write into each configured sink, in declaration order.
///
/// The first sink error aborts the whole run; remaining sinks are not
/// attempted.
struct Fanout<'a> {
    sinks: &'a mut [ByteSink],
}

impl<'a> Fanout<'a> {
    fn new(sinks: &'a mut [ByteSink]) -> Self {
        Self { sinks }
    }

    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        for sink in self.sinks.iter_mut() {
            sink.write_all(buf).await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        for sink in self.sinks.iter_mut() {
            sink.flush().await?;
        }
        Ok(())
    }
}

/// Encrypts a byte source into one or more byte sinks using a master key.
pub struct Encoder<'a> {
    buffer_size: usize,
    master: &'a MasterKey,
    input: &'a mut ByteSource,
    output: Fanout<'a>,
}

impl<'a> Encoder<'a> {
    /// `buffer_size` of 0 selects [`DEFAULT_BUFFER_SIZE`].
    pub fn new(
        buffer_size: usize,
        master: &'a MasterKey,
        input: &'a mut ByteSource,
        outputs: &'a mut [ByteSink],
    ) -> Self {
        let buffer_size = if buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            buffer_size
        };
        Self {
            buffer_size,
            master,
            input,
            output: Fanout::new(outputs),
        }
    }

    /// Runs the encoder without external cancellation.
    pub async fn encode(self) -> Result<Status> {
        self.encode_with(&CancellationToken::new()).await
    }

    /// Encrypts the source into the sinks, observing `cancel` between chunks.
    ///
    /// `Ok(Completed)` or `Ok(Cancelled)` on a clean exit; any `Err` means
    /// the task failed.
    pub async fn encode_with(mut self, cancel: &CancellationToken) -> Result<Status> {
        if !self.master.is_valid() {
            return Err(Error::InvalidKey);
        }

        let iv = random_iv();
        self.output.write_all(self.master.signature()).await?;
        self.output.write_all(&iv).await?;

        if cancel.is_cancelled() {
            return Ok(Status::Cancelled);
        }

        let mut cipher = CfbEnc::new(self.master.key(), &iv)?;
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            if cancel.is_cancelled() {
                return Ok(Status::Cancelled);
            }
            let n = self.input.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            cipher.apply(&mut buf[..n]);
            self.output.write_all(&buf[..n]).await?;
        }
        self.output.flush().await?;
        Ok(Status::Completed)
    }
}

/// Decrypts an envelope from a byte source into one or more byte sinks.
pub struct Decoder<'a> {
    buffer_size: usize,
    master: &'a MasterKey,
    input: &'a mut ByteSource,
    output: Fanout<'a>,
}

impl<'a> Decoder<'a> {
    /// `buffer_size` of 0 selects [`DEFAULT_BUFFER_SIZE`].
    pub fn new(
        buffer_size: usize,
        master: &'a MasterKey,
        input: &'a mut ByteSource,
        outputs: &'a mut [ByteSink],
    ) -> Self {
        let buffer_size = if buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            buffer_size
        };
        Self {
            buffer_size,
            master,
            input,
            output: Fanout::new(outputs),
        }
    }

    /// Runs the decoder without external cancellation.
    pub async fn decode(self) -> Result<Status> {
        self.decode_with(&CancellationToken::new()).await
    }

    /// Decrypts the envelope, observing `cancel` between chunks.
    ///
    /// The input must have been encoded with the same master key; a
    /// signature mismatch or an envelope shorter than 44 bytes fails with
    /// `InvalidSignature` before any output is written.
    pub async fn decode_with(mut self, cancel: &CancellationToken) -> Result<Status> {
        if !self.master.is_valid() {
            return Err(Error::InvalidKey);
        }

        let mut meta = [0u8; SIGNATURE_SIZE + IV_SIZE];
        self.input.read_exact(&mut meta).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::InvalidSignature
            } else {
                Error::Io(e)
            }
        })?;
        if meta[..SIGNATURE_SIZE] != *self.master.signature() {
            return Err(Error::InvalidSignature);
        }

        if cancel.is_cancelled() {
            return Ok(Status::Cancelled);
        }

        let mut cipher = CfbDec::new(self.master.key(), &meta[SIGNATURE_SIZE..])?;
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            if cancel.is_cancelled() {
                return Ok(Status::Cancelled);
            }
            let n = self.input.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            cipher.apply(&mut buf[..n]);
            self.output.write_all(&buf[..n]).await?;
        }
        self.output.flush().await?;
        Ok(Status::Completed)
    }
}
