use crate::error::{RepositoryError, Result};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::io::{self, Read, Write};
#[cfg(feature = "tokio")]
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame either side accepts.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// A collect call: the filter string and the buffer size the caller offers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectRequest {
    pub filter: String,
    pub buffer_size: u32,
}

/// The answer to a [`CollectRequest`].
///
/// `MoreData` carries the complete objects that fit in the offered buffer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum CollectResponse {
    Success {
        object_types: u32,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    MoreData {
        object_types: u32,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    Failure {
        message: String,
    },
}

impl TryFrom<&Vec<u8>> for CollectRequest {
    type Error = RepositoryError;

    fn try_from(buffer: &Vec<u8>) -> Result<Self, Self::Error> {
        rmp_serde::from_slice(buffer).map_err(RepositoryError::from)
    }
}

impl TryFrom<CollectRequest> for Vec<u8> {
    type Error = RepositoryError;

    fn try_from(request: CollectRequest) -> Result<Self, Self::Error> {
        rmp_serde::to_vec(&request).map_err(RepositoryError::from)
    }
}

impl TryFrom<&Vec<u8>> for CollectResponse {
    type Error = RepositoryError;

    fn try_from(buffer: &Vec<u8>) -> Result<Self, Self::Error> {
        rmp_serde::from_slice(buffer).map_err(RepositoryError::from)
    }
}

impl TryFrom<CollectResponse> for Vec<u8> {
    type Error = RepositoryError;

    fn try_from(response: CollectResponse) -> Result<Self, Self::Error> {
        rmp_serde::to_vec(&response).map_err(RepositoryError::from)
    }
}

fn frame_len(payload: &[u8]) -> Result<u32> {
    u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or_else(|| RepositoryError::Transport(format!("{} byte frame", payload.len())))
}

fn check_len(len: u32) -> Result<usize> {
    if len > MAX_FRAME_LEN {
        return Err(RepositoryError::Transport(format!(
            "peer announced a {len} byte frame"
        )));
    }
    Ok(len as usize)
}

/// Writes `payload` behind a little-endian `u32` length.
pub(crate) fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = frame_len(payload)?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(payload)?;
    writer.flush().map_err(Into::into)
}

/// Reads one frame, `None` once the peer closed the stream.
pub(crate) fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len = [0; 4];
    match reader.read_exact(&mut len) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let mut payload = vec![0; check_len(u32::from_le_bytes(len))?];
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}

/// Reads and decodes one message, `None` once the peer closed the stream.
pub(crate) fn read_message<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    read_frame(reader)?
        .map(|payload| rmp_serde::from_slice(&payload).map_err(RepositoryError::from))
        .transpose()
}

#[cfg(feature = "tokio")]
pub(crate) async fn write_frame_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<()> {
    let len = frame_len(payload)?;
    writer.write_u32_le(len).await?;
    writer.write_all(payload).await?;
    writer.flush().await.map_err(Into::into)
}

#[cfg(feature = "tokio")]
pub(crate) async fn read_frame_async<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>> {
    let len = match reader.read_u32_le().await {
        Ok(len) => len,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut payload = vec![0; check_len(len)?];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_frames_on_one_stream() {
        let request = CollectRequest {
            filter: "1 2".into(),
            buffer_size: 4096,
        };
        let response = CollectResponse::MoreData {
            object_types: 1,
            data: vec![7; 64],
        };
        let mut stream = Vec::new();
        write_frame(&mut stream, &Vec::<u8>::try_from(request.clone()).unwrap()).unwrap();
        write_frame(&mut stream, &Vec::<u8>::try_from(response.clone()).unwrap()).unwrap();

        let mut reader = Cursor::new(stream);
        let read: CollectRequest = read_message(&mut reader).unwrap().unwrap();
        assert_eq!(read, request);
        let frame = read_frame(&mut reader).unwrap().unwrap();
        assert_eq!(CollectResponse::try_from(&frame).unwrap(), response);
        assert!(read_frame(&mut reader).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut reader = Cursor::new((MAX_FRAME_LEN + 1).to_le_bytes().to_vec());
        assert!(matches!(
            read_frame(&mut reader),
            Err(RepositoryError::Transport(_))
        ));
    }

    #[test]
    fn test_truncated_frame_is_an_error() {
        let mut stream = Vec::new();
        write_frame(&mut stream, b"abcdef").unwrap();
        stream.truncate(7);
        assert!(matches!(
            read_frame(&mut Cursor::new(stream)),
            Err(RepositoryError::Io(_))
        ));
    }
}
