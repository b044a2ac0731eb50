use super::{
    DEFAULT_SOCKET, MAX_BUFFER_SIZE,
    protocol::{CollectRequest, CollectResponse, read_message, write_frame},
    socket_name,
};
use crate::{
    collect::CollectStatus,
    error::{RepositoryError, Result},
};
use interprocess::local_socket::prelude::*;
use std::io::BufReader;

/// The objects returned by one collect call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectReply {
    pub status: CollectStatus,
    pub object_types: u32,
    pub data: Vec<u8>,
}

/// Issues collect calls to a [`CollectServer`](super::CollectServer).
///
/// ```no_run
/// use metrics_shm_repository::{CollectClient, decode_objects};
///
/// let mut client = CollectClient::open("metrics_shm_repository.sock").unwrap();
/// let reply = client.collect_all("Global", 4096).unwrap();
/// for object in decode_objects(&reply.data).unwrap() {
///     println!("{} with {} instances", object.name_index, object.instances.len());
/// }
/// client.close();
/// ```
pub struct CollectClient {
    stream: BufReader<LocalSocketStream>,
}

impl CollectClient {
    /// Connects to the endpoint listening on `socket_path`.
    ///
    /// # Errors
    /// Returns an error if nothing listens on the socket.
    pub fn open(socket_path: &str) -> Result<Self> {
        let stream = LocalSocketStream::connect(socket_name(socket_path)?)?;
        log::debug!("connected to collect endpoint {socket_path}");
        Ok(Self {
            stream: BufReader::new(stream),
        })
    }

    /// Connects to the endpoint on the default socket.
    ///
    /// # Errors
    /// Returns an error if nothing listens on the socket.
    pub fn open_default() -> Result<Self> {
        Self::open(DEFAULT_SOCKET)
    }

    /// Collects the categories `filter` selects into at most `buffer_size`
    /// bytes.
    ///
    /// # Errors
    /// `Transport` when the provider reports a failure or hangs up, IO and
    /// decoding errors from the socket.
    pub fn collect(&mut self, filter: &str, buffer_size: u32) -> Result<CollectReply> {
        let request: Vec<u8> = CollectRequest {
            filter: filter.to_string(),
            buffer_size,
        }
        .try_into()?;
        write_frame(self.stream.get_mut(), &request)?;

        match read_message::<_, CollectResponse>(&mut self.stream)? {
            Some(CollectResponse::Success { object_types, data }) => Ok(CollectReply {
                status: CollectStatus::Success,
                object_types,
                data,
            }),
            Some(CollectResponse::MoreData { object_types, data }) => Ok(CollectReply {
                status: CollectStatus::MoreData,
                object_types,
                data,
            }),
            Some(CollectResponse::Failure { message }) => Err(RepositoryError::Transport(message)),
            None => Err(RepositoryError::Transport(
                "collect endpoint closed the connection".into(),
            )),
        }
    }

    /// Collects everything `filter` selects, doubling the buffer after every
    /// `MoreData` reply until the objects fit or the buffer reaches
    /// [`MAX_BUFFER_SIZE`]. The last reply is returned either way.
    ///
    /// # Errors
    /// See [`collect`](Self::collect).
    pub fn collect_all(&mut self, filter: &str, initial_size: u32) -> Result<CollectReply> {
        let mut buffer_size = initial_size.clamp(1, MAX_BUFFER_SIZE);
        loop {
            let reply = self.collect(filter, buffer_size)?;
            if reply.status == CollectStatus::Success || buffer_size == MAX_BUFFER_SIZE {
                return Ok(reply);
            }
            log::trace!("{buffer_size} byte collect buffer too small, retrying");
            buffer_size = buffer_size.saturating_mul(2).min(MAX_BUFFER_SIZE);
        }
    }

    /// Disconnects from the endpoint.
    pub fn close(self) {
        log::debug!("closed collect connection");
    }
}
