//! Message framing for the length-prefixed stream protocol
//!
//! Format: `[u32 big-endian length][payload]`, one protocol message per frame.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::game::constants::net::MAX_MESSAGE_SIZE;

/// Errors that can occur during message framing
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {0} bytes (max {1})")]
    MessageTooLarge(usize, usize),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Read one length-prefixed message
pub async fn read_message<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>, FramingError> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(FramingError::ConnectionClosed);
        }
        Err(e) => return Err(FramingError::Io(e)),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(FramingError::MessageTooLarge(len, MAX_MESSAGE_SIZE));
    }
    if len == 0 {
        return Ok(Vec::new());
    }

    let mut buf = vec![0u8; len];
    match stream.read_exact(&mut buf).await {
        Ok(_) => Ok(buf),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(FramingError::ConnectionClosed),
        Err(e) => Err(FramingError::Io(e)),
    }
}

/// Write one length-prefixed message without flushing
pub async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, data: &[u8]) -> Result<(), FramingError> {
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(FramingError::MessageTooLarge(data.len(), MAX_MESSAGE_SIZE));
    }
    let len_bytes = (data.len() as u32).to_be_bytes();
    stream.write_all(&len_bytes).await?;
    stream.write_all(data).await?;
    Ok(())
}

/// Write one length-prefixed message and flush
pub async fn write_message<W: AsyncWrite + Unpin>(stream: &mut W, data: &[u8]) -> Result<(), FramingError> {
    write_frame(stream, data).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_read_write_message() {
        let data = [2u8, 0, 10, 0, 20, 0, 1, 0, 0];
        let mut buffer = Vec::new();
        write_message(&mut buffer, &data).await.unwrap();
        assert_eq!(&buffer[..4], &[0, 0, 0, 9]);

        let mut cursor = Cursor::new(buffer);
        let result = read_message(&mut cursor).await.unwrap();
        assert_eq!(result, data);
    }

    #[tokio::test]
    async fn test_read_split_across_reads() {
        let mut mock = Builder::new()
            .read(&[0, 0])
            .read(&[0, 3, 7])
            .read(&[1, 2])
            .build();
        let result = read_message(&mut mock).await.unwrap();
        assert_eq!(result, vec![7, 1, 2]);
    }

    #[tokio::test]
    async fn test_write_is_big_endian() {
        let mut mock = Builder::new().write(&[0, 0, 1, 0]).write(&[4u8; 256]).build();
        write_message(&mut mock, &[4u8; 256]).await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_message() {
        let mut buffer = Vec::new();
        write_message(&mut buffer, b"").await.unwrap();

        let mut cursor = Cursor::new(buffer);
        let result = read_message(&mut cursor).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_message_too_large() {
        let large_data = vec![0u8; MAX_MESSAGE_SIZE + 1];
        let mut buffer = Vec::new();
        let result = write_message(&mut buffer, &large_data).await;
        assert!(matches!(result, Err(FramingError::MessageTooLarge(_, _))));

        let header = ((MAX_MESSAGE_SIZE + 1) as u32).to_be_bytes();
        let mut mock = Builder::new().read(&header).build();
        let result = read_message(&mut mock).await;
        assert!(matches!(result, Err(FramingError::MessageTooLarge(_, _))));
    }

    #[tokio::test]
    async fn test_read_truncated_length() {
        let mut cursor = Cursor::new(vec![0u8; 2]);
        let result = read_message(&mut cursor).await;
        assert!(matches!(result, Err(FramingError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_read_truncated_payload() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&10u32.to_be_bytes());
        buffer.extend_from_slice(&[1, 2, 3]);

        let mut cursor = Cursor::new(buffer);
        let result = read_message(&mut cursor).await;
        assert!(matches!(result, Err(FramingError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_read_io_error() {
        let mut mock = Builder::new()
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let result = read_message(&mut mock).await;
        assert!(matches!(result, Err(FramingError::Io(_))));
    }

    #[tokio::test]
    async fn test_multiple_messages() {
        let messages = vec![vec![17u8], vec![21u8], vec![9u8, 0, 0, 0, 25, 0, 0]];

        let mut buffer = Vec::new();
        for msg in &messages {
            write_frame(&mut buffer, msg).await.unwrap();
        }

        let mut cursor = Cursor::new(buffer);
        for expected in &messages {
            let result = read_message(&mut cursor).await.unwrap();
            assert_eq!(&result, expected);
        }
    }
}
