//! Byte-level readers for wire message parts.

use crate::error::ProtocolError;
use crate::header::{MsgHeader, HEADER_LEN};
use crate::{MAX_CSTRING_LEN, MAX_DOCUMENT_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Reads a NUL-terminated string, returning the bytes including the
/// terminator.
pub async fn read_cstring<R>(r: &mut R) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut out = Vec::with_capacity(64);
    loop {
        let b = r.read_u8().await?;
        out.push(b);
        if b == 0 {
            return Ok(out);
        }
        if out.len() >= MAX_CSTRING_LEN {
            return Err(ProtocolError::CStringTooLong(MAX_CSTRING_LEN));
        }
    }
}

/// Reads exactly one BSON document and returns its raw bytes.
///
/// The 4-byte length prefix covers itself, so a document shorter than 5
/// bytes cannot exist. A stream that ends before `length` bytes arrive is
/// reported as an invalid document rather than a bare I/O error.
pub async fn read_document<R>(r: &mut R) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = i32::from_le_bytes(len_buf);
    if len < 5 {
        return Err(ProtocolError::InvalidDocument(len));
    }
    if len > MAX_DOCUMENT_SIZE {
        return Err(ProtocolError::DocumentTooLarge {
            size: len,
            max: MAX_DOCUMENT_SIZE,
        });
    }

    let mut doc = vec![0u8; len as usize];
    doc[0..4].copy_from_slice(&len_buf);
    r.read_exact(&mut doc[4..]).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::InvalidDocument(len)
        } else {
            ProtocolError::Io(e)
        }
    })?;
    Ok(doc)
}

/// Copies one complete message from `src` to `dst`.
///
/// Reads a header, forwards it, then forwards exactly
/// `messageLength - 16` payload bytes without interpreting them.
pub async fn copy_message<W, R>(dst: &mut W, src: &mut R) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let header = MsgHeader::read_from(src).await?;
    dst.write_all(&header.to_wire()).await?;
    copy_exact(dst, src, header.body_len()).await?;
    Ok(())
}

/// Forwards exactly `n` bytes from `src` to `dst`.
pub async fn copy_exact<W, R>(dst: &mut W, src: &mut R, n: u64) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    if n == 0 {
        return Ok(());
    }
    let copied = tokio::io::copy(&mut src.take(n), dst).await?;
    if copied != n {
        return Err(ProtocolError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("copied {} of {} bytes", copied, n),
        )));
    }
    Ok(())
}

/// Discards exactly `n` bytes from `src`.
pub async fn discard_exact<R>(src: &mut R, n: u64) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut sink = tokio::io::sink();
    copy_exact(&mut sink, src, n).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::OpCode;

    #[tokio::test]
    async fn test_read_cstring() {
        let mut input: &[u8] = b"admin.$cmd\0trailing";
        let s = read_cstring(&mut input).await.unwrap();
        assert_eq!(s, b"admin.$cmd\0");
        assert_eq!(input, b"trailing");
    }

    #[tokio::test]
    async fn test_read_cstring_eof() {
        let mut input: &[u8] = b"no terminator";
        assert!(read_cstring(&mut input).await.is_err());
    }

    #[tokio::test]
    async fn test_read_cstring_too_long() {
        let long = vec![b'x'; MAX_CSTRING_LEN + 1];
        let mut input: &[u8] = &long;
        let err = read_cstring(&mut input).await.unwrap_err();
        assert!(matches!(err, ProtocolError::CStringTooLong(_)));
    }

    #[tokio::test]
    async fn test_read_document_minimal() {
        // An empty BSON document: length 5, no elements, trailing NUL.
        let mut input: &[u8] = &[5, 0, 0, 0, 0];
        let doc = read_document(&mut input).await.unwrap();
        assert_eq!(doc, [5, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_read_document_bad_length() {
        let mut input: &[u8] = &[4, 0, 0, 0, 0];
        let err = read_document(&mut input).await.unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidDocument(4)));
    }

    #[tokio::test]
    async fn test_read_document_underflow() {
        // Claims 10 bytes but only 6 are available.
        let mut input: &[u8] = &[10, 0, 0, 0, 0, 0];
        let err = read_document(&mut input).await.unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidDocument(10)));
    }

    #[tokio::test]
    async fn test_read_document_too_large() {
        let len = MAX_DOCUMENT_SIZE + 1;
        let mut input: &[u8] = &len.to_le_bytes();
        let err = read_document(&mut input).await.unwrap_err();
        assert!(matches!(err, ProtocolError::DocumentTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_copy_message_exact_length() {
        let body = [7u8; 24];
        let header = MsgHeader {
            message_length: (HEADER_LEN + body.len()) as i32,
            request_id: 9,
            response_to: 0,
            op_code: OpCode::Insert,
        };
        let mut wire = header.to_wire().to_vec();
        wire.extend_from_slice(&body);
        // Extra bytes after the message must not be consumed.
        wire.extend_from_slice(b"NEXT");

        let mut src = &wire[..];
        let mut dst = Vec::new();
        copy_message(&mut dst, &mut src).await.unwrap();

        assert_eq!(dst.len(), header.message_length as usize);
        assert_eq!(&dst[HEADER_LEN..], &body);
        assert_eq!(src, b"NEXT");
    }

    #[tokio::test]
    async fn test_copy_message_truncated_body() {
        let header = MsgHeader {
            message_length: 40,
            request_id: 1,
            response_to: 0,
            op_code: OpCode::Delete,
        };
        let wire = header.to_wire().to_vec();
        let mut src = &wire[..];
        let mut dst = Vec::new();
        assert!(copy_message(&mut dst, &mut src).await.is_err());
    }

    #[tokio::test]
    async fn test_discard_exact() {
        let mut input: &[u8] = b"0123456789";
        discard_exact(&mut input, 4).await.unwrap();
        assert_eq!(input, b"456789");
    }
}
