//! RFC 6455 frame codec.

use rand::RngCore;
use shared::error::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(Error::ErrWsProtocol(format!("reserved opcode {other:#x}"))),
        }
    }

    fn bits(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

#[derive(Debug)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
    /// Payload bytes dropped because the frame exceeded the receive cap.
    pub discarded: usize,
}

/// Reads one frame, unmasking if needed. At most `cap` payload bytes are
/// kept; the remainder of an oversized frame is consumed and discarded.
pub async fn read_frame<R>(reader: &mut R, cap: usize) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 2];
    reader.read_exact(&mut head).await?;

    let fin = head[0] & 0x80 != 0;
    if head[0] & 0x70 != 0 {
        return Err(Error::ErrWsProtocol("reserved bits set".to_owned()));
    }
    let opcode = Opcode::from_bits(head[0] & 0x0F)?;
    let masked = head[1] & 0x80 != 0;

    let length = match head[1] & 0x7F {
        126 => {
            let mut ext = [0u8; 2];
            reader.read_exact(&mut ext).await?;
            u64::from(u16::from_be_bytes(ext))
        }
        127 => {
            let mut ext = [0u8; 8];
            reader.read_exact(&mut ext).await?;
            u64::from_be_bytes(ext)
        }
        n => u64::from(n),
    };

    if opcode.is_control() && (!fin || length > 125) {
        return Err(Error::ErrWsProtocol("invalid control frame".to_owned()));
    }

    let mut masking_key = [0u8; 4];
    if masked {
        reader.read_exact(&mut masking_key).await?;
    }

    let keep = length.min(cap as u64) as usize;
    let mut payload = vec![0u8; keep];
    reader.read_exact(&mut payload).await?;

    // drain whatever exceeds the cap
    let mut discarded = 0usize;
    let mut remaining = length - keep as u64;
    let mut scratch = [0u8; 4096];
    while remaining > 0 {
        let chunk = remaining.min(scratch.len() as u64) as usize;
        reader.read_exact(&mut scratch[..chunk]).await?;
        discarded += chunk;
        remaining -= chunk as u64;
    }

    if masked {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= masking_key[i % 4];
        }
    }

    Ok(Frame {
        fin,
        opcode,
        payload,
        discarded,
    })
}

/// Writes one frame. Client-originated frames are masked with a random key.
pub async fn write_frame<W>(
    writer: &mut W,
    opcode: Opcode,
    payload: &[u8],
    mask: bool,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut head = Vec::with_capacity(14);
    head.push(0x80 | opcode.bits());

    let mask_bit = if mask { 0x80 } else { 0x00 };
    match payload.len() {
        n if n <= 125 => head.push(mask_bit | n as u8),
        n if n <= u16::MAX as usize => {
            head.push(mask_bit | 126);
            head.extend_from_slice(&(n as u16).to_be_bytes());
        }
        n => {
            head.push(mask_bit | 127);
            head.extend_from_slice(&(n as u64).to_be_bytes());
        }
    }

    if mask {
        let mut masking_key = [0u8; 4];
        rand::rng().fill_bytes(&mut masking_key);
        head.extend_from_slice(&masking_key);
        writer.write_all(&head).await?;
        let mut masked = payload.to_vec();
        for (i, byte) in masked.iter_mut().enumerate() {
            *byte ^= masking_key[i % 4];
        }
        writer.write_all(&masked).await?;
    } else {
        writer.write_all(&head).await?;
        writer.write_all(payload).await?;
    }
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod frame_test {
    use super::*;

    #[tokio::test]
    async fn test_unmasked_round_trip() {
        let mut cursor = std::io::Cursor::new(Vec::new());
        write_frame(&mut cursor, Opcode::Text, b"hi", false).await.unwrap();
        let wire = cursor.into_inner();
        assert_eq!(wire, vec![0x81, 0x02, b'h', b'i']);

        let frame = read_frame(&mut wire.as_slice(), 1024).await.unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(frame.payload, b"hi");
        assert_eq!(frame.discarded, 0);
    }

    #[tokio::test]
    async fn test_masked_round_trip() {
        let payload: Vec<u8> = (0..=255u8).collect();
        let mut cursor = std::io::Cursor::new(Vec::new());
        write_frame(&mut cursor, Opcode::Binary, &payload, true).await.unwrap();
        let wire = cursor.into_inner();
        // masked payload differs from the original on the wire
        assert_ne!(&wire[6..], &payload[..]);

        let frame = read_frame(&mut wire.as_slice(), 1024).await.unwrap();
        assert_eq!(frame.payload, payload);
    }

    #[tokio::test]
    async fn test_extended_length_16() {
        let payload = vec![7u8; 300];
        let mut cursor = std::io::Cursor::new(Vec::new());
        write_frame(&mut cursor, Opcode::Binary, &payload, false).await.unwrap();
        let wire = cursor.into_inner();
        assert_eq!(wire[1], 126);
        assert_eq!(u16::from_be_bytes([wire[2], wire[3]]), 300);

        let frame = read_frame(&mut wire.as_slice(), 1024).await.unwrap();
        assert_eq!(frame.payload.len(), 300);
    }

    #[tokio::test]
    async fn test_truncation_at_cap() {
        let payload = vec![1u8; 1001];
        let mut cursor = std::io::Cursor::new(Vec::new());
        write_frame(&mut cursor, Opcode::Binary, &payload, false).await.unwrap();
        let wire = cursor.into_inner();

        let frame = read_frame(&mut wire.as_slice(), 1000).await.unwrap();
        assert_eq!(frame.payload.len(), 1000);
        assert_eq!(frame.discarded, 1);
    }

    #[tokio::test]
    async fn test_oversized_control_frame_rejected() {
        let mut wire = vec![0x89, 126, 0x00, 0x80];
        wire.extend(vec![0u8; 128]);
        assert!(read_frame(&mut wire.as_slice(), 1024).await.is_err());
    }
}
