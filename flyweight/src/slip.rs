use std::fmt::{self, Display};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

use crate::Result;

const END: u8 = 0xC0;
const ESC: u8 = 0xDB;
const ESC_END: u8 = 0xDC;
const ESC_ESC: u8 = 0xDD;

/// Largest packet the radio carries: a 125 byte frame less the 2 byte MAC trailer.
pub const MAX_PACKET_BYTES: usize = 125 - 2;
/// Worst case for a fully escaped packet plus its terminating END.
pub const MAX_FRAME_BYTES: usize = 2 * MAX_PACKET_BYTES + 1;

const SYNC_ENDS: usize = 3;

#[derive(Clone, Debug, PartialEq)]
pub enum FrameError {
    PayloadTooLong(usize),
    /// The frame outgrew `MAX_FRAME_BYTES`. Holds what was captured before giving up.
    Overflow(Vec<u8>),
}

impl Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::PayloadTooLong(len) => write!(f, "payload too long: {} bytes", len),
            FrameError::Overflow(captured) => {
                write!(f, "frame overflow after {} bytes", captured.len())
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// Escape `payload` and terminate it with END.
pub fn encode(payload: &[u8]) -> std::result::Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_PACKET_BYTES - 1 {
        return Err(FrameError::PayloadTooLong(payload.len()));
    }

    let mut frame = Vec::with_capacity(payload.len() * 2 + 1);
    for byte in payload {
        match *byte {
            END => frame.extend_from_slice(&[ESC, ESC_END]),
            ESC => frame.extend_from_slice(&[ESC, ESC_ESC]),
            byte => frame.push(byte),
        }
    }
    frame.push(END);
    Ok(frame)
}

/// Incremental frame decoder. Holds a partial frame between calls to `push`.
#[derive(Debug, Default)]
struct Decoder {
    frame: Vec<u8>,
    escaping: bool,
    discarding: bool,
}

impl Decoder {
    fn push(&mut self, byte: u8) -> Option<std::result::Result<Vec<u8>, FrameError>> {
        if self.discarding {
            if byte == END {
                self.discarding = false;
            }
            return None;
        }

        if self.escaping {
            self.escaping = false;
            let byte = match byte {
                ESC_END => END,
                ESC_ESC => ESC,
                // Not a valid escape, but tolerated.
                other => other,
            };
            return self.accumulate(byte);
        }

        match byte {
            // Keepalive or leading sync.
            END if self.frame.is_empty() => None,
            END => Some(Ok(std::mem::take(&mut self.frame))),
            ESC => {
                self.escaping = true;
                None
            }
            byte => self.accumulate(byte),
        }
    }

    fn accumulate(&mut self, byte: u8) -> Option<std::result::Result<Vec<u8>, FrameError>> {
        self.frame.push(byte);
        if self.frame.len() > MAX_FRAME_BYTES {
            self.discarding = true;
            return Some(Err(FrameError::Overflow(std::mem::take(&mut self.frame))));
        }
        None
    }
}

pub struct Reader<R>
where
    R: AsyncRead + Unpin,
{
    inner: BufReader<R>,
    decoder: Decoder,
}

impl<R> Reader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(read: R) -> Self {
        Self {
            inner: BufReader::new(read),
            decoder: Decoder::default(),
        }
    }

    /// Reads the next complete frame.
    ///
    /// Cancel safe: a partially read frame is kept and completed by the next call.
    pub async fn read_frame(&mut self) -> Result<Vec<u8>> {
        loop {
            let byte = self.inner.read_u8().await?;
            if let Some(result) = self.decoder.push(byte) {
                return Ok(result?);
            }
        }
    }
}

pub struct Writer<W>
where
    W: AsyncWrite + Unpin,
{
    inner: BufWriter<W>,
}

impl<W> Writer<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(write: W) -> Self {
        Self {
            inner: BufWriter::new(write),
        }
    }

    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        let frame = encode(payload)?;
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Lets the radio find a frame boundary after it (or we) restarted.
    pub async fn write_sync(&mut self) -> Result<()> {
        self.inner.write_all(&[END; SYNC_ENDS]).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::ErrorKind;

    fn decode_all(bytes: &[u8]) -> Vec<std::result::Result<Vec<u8>, FrameError>> {
        let mut decoder = Decoder::default();
        bytes.iter().filter_map(|byte| decoder.push(*byte)).collect()
    }

    #[test]
    fn escapes_end_and_esc() {
        assert_eq!(encode(&[0xC0]).unwrap(), vec![0xDB, 0xDC, 0xC0]);
        assert_eq!(encode(&[0xDB]).unwrap(), vec![0xDB, 0xDD, 0xC0]);
        assert_eq!(encode(&[0x01, 0x02]).unwrap(), vec![0x01, 0x02, 0xC0]);
    }

    #[test]
    fn rejects_oversized_payload() {
        let payload = vec![0x55; MAX_PACKET_BYTES];
        assert_eq!(
            encode(&payload),
            Err(FrameError::PayloadTooLong(MAX_PACKET_BYTES))
        );
        assert!(encode(&payload[1..]).is_ok());
    }

    #[test]
    fn round_trips_special_bytes_in_every_position() {
        for len in 1..MAX_PACKET_BYTES {
            for position in 0..len {
                for special in &[END, ESC] {
                    let mut payload: Vec<u8> = (0..len).map(|i| (i % 0xC0) as u8).collect();
                    payload[position] = *special;

                    let frame = encode(&payload).unwrap();
                    assert!(frame.len() <= MAX_FRAME_BYTES);
                    assert_eq!(decode_all(&frame), vec![Ok(payload)]);
                }
            }
        }
    }

    #[test]
    fn skips_leading_and_repeated_ends() {
        let frames = decode_all(&[END, END, END, 0x01, END, END, 0x02, END]);
        assert_eq!(frames, vec![Ok(vec![0x01]), Ok(vec![0x02])]);
    }

    #[test]
    fn tolerates_unknown_escape() {
        assert_eq!(decode_all(&[ESC, 0x42, 0x43, END]), vec![Ok(vec![0x42, 0x43])]);
    }

    #[test]
    fn overflow_yields_capture_and_resyncs() {
        let mut bytes = vec![0x11; MAX_FRAME_BYTES + 5];
        bytes.push(END);
        bytes.extend_from_slice(&[0x22, END]);

        let frames = decode_all(&bytes);
        assert_eq!(frames.len(), 2);
        match &frames[0] {
            Err(FrameError::Overflow(captured)) => assert_eq!(captured.len(), MAX_FRAME_BYTES + 1),
            other => panic!("expected overflow, got {:?}", other),
        }
        assert_eq!(frames[1], Ok(vec![0x22]));
    }

    #[tokio::test]
    async fn reader_and_writer_over_a_pipe() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = Writer::new(client);
        let mut reader = Reader::new(server);

        writer.write_sync().await.unwrap();
        writer.write_frame(&[0x01, END, ESC, 0x02]).await.unwrap();
        writer.write_frame(&[0x03]).await.unwrap();

        assert_eq!(reader.read_frame().await.unwrap(), vec![0x01, END, ESC, 0x02]);
        assert_eq!(reader.read_frame().await.unwrap(), vec![0x03]);
    }

    #[tokio::test]
    async fn cancelled_read_keeps_partial_frame() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = Reader::new(server);

        client.write_all(&[0x01, ESC]).await.unwrap();
        let timed_out =
            tokio::time::timeout(Duration::from_millis(20), reader.read_frame()).await;
        assert!(timed_out.is_err());

        client.write_all(&[ESC_END, 0x02, END]).await.unwrap();
        assert_eq!(reader.read_frame().await.unwrap(), vec![0x01, END, 0x02]);
    }

    #[tokio::test]
    async fn reader_reports_closed_stream() {
        let (client, server) = tokio::io::duplex(16);
        let mut reader = Reader::new(server);
        drop(client);

        let error = reader.read_frame().await.unwrap_err();
        assert!(matches!(error.kind, ErrorKind::Io(_)));
    }
}
