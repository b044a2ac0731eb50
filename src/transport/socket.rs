use super::{
    DEFAULT_SOCKET, MAX_BUFFER_SIZE,
    protocol::{CollectRequest, CollectResponse},
    socket_name,
};
use crate::{
    collect::{CollectFilter, CollectStatus},
    error::Result,
    provider::PerfProvider,
};
use interprocess::local_socket::ListenerOptions;
#[cfg(feature = "tokio")]
use interprocess::local_socket::tokio::prelude::*;
#[cfg(not(feature = "tokio"))]
use interprocess::local_socket::{Stream, prelude::*};
#[cfg(not(feature = "tokio"))]
use std::{io::BufReader, thread};
use std::{path::PathBuf, sync::Arc};
#[cfg(feature = "tokio")]
use tokio::{io::BufReader, task};

/// Serves collect calls for a provider over a local socket.
pub struct CollectServer {
    socket_path: String,
}

impl Default for CollectServer {
    fn default() -> Self {
        Self {
            socket_path: DEFAULT_SOCKET.into(),
        }
    }
}

impl CollectServer {
    /// Sets the path for the IPC socket file.
    #[must_use]
    pub fn socket(mut self, socket_path: &str) -> Self {
        self.socket_path = socket_path.to_string();
        self
    }

    /// Starts answering collect calls against `provider`.
    ///
    /// A background thread (or task, with the `tokio` feature) accepts
    /// connections; each connection is served until the client hangs up.
    /// If the socket file already exists, it is removed first.
    ///
    /// # Example
    /// ```
    /// use metrics_shm_repository::{CollectServer, PerfProvider, RepositoryConfig};
    /// use std::sync::Arc;
    ///
    /// let provider = Arc::new(PerfProvider::in_memory(RepositoryConfig::default()));
    /// if let Err(e) = CollectServer::default().start_serving(provider) {
    ///     eprintln!("Failed to start collect endpoint: {e}");
    /// }
    /// ```
    ///
    /// # Errors
    /// Returns an error if the stale socket file can not be removed.
    pub fn start_serving(self, provider: Arc<PerfProvider>) -> Result<()> {
        let socket_path = self.socket_path;
        let socket_file: PathBuf = format!("/tmp/{socket_path}").into();
        if socket_file.exists() {
            std::fs::remove_file(&socket_file)?;
        }

        #[cfg(not(feature = "tokio"))]
        thread::spawn(move || {
            if let Err(e) = run_server(&socket_path, &provider) {
                log::error!("Collect endpoint error: {e}");
            }
            let _ = std::fs::remove_file(&socket_file);
        });

        #[cfg(feature = "tokio")]
        task::spawn(async move {
            if let Err(e) = run_server(&socket_path, provider).await {
                log::error!("Collect endpoint error: {e}");
            }
            let _ = std::fs::remove_file(&socket_file);
        });

        Ok(())
    }
}

fn respond(provider: &PerfProvider, request: &CollectRequest) -> CollectResponse {
    let filter: CollectFilter = request.filter.parse().unwrap_or_default();
    let mut buf = vec![0; request.buffer_size.min(MAX_BUFFER_SIZE) as usize];
    match provider.collect(&filter, &mut buf) {
        Ok(outcome) => {
            buf.truncate(outcome.bytes_written);
            match outcome.status {
                CollectStatus::Success => CollectResponse::Success {
                    object_types: outcome.object_types,
                    data: buf,
                },
                CollectStatus::MoreData => CollectResponse::MoreData {
                    object_types: outcome.object_types,
                    data: buf,
                },
            }
        }
        Err(e) => {
            log::warn!("collect for {:?} failed: {e}", request.filter);
            CollectResponse::Failure {
                message: e.to_string(),
            }
        }
    }
}

#[cfg(not(feature = "tokio"))]
fn handle_error(conn: std::io::Result<Stream>) -> Option<Stream> {
    match conn {
        Ok(c) => Some(c),
        Err(e) => {
            log::warn!("Failed to accept connection: {e}");
            None
        }
    }
}

#[cfg(not(feature = "tokio"))]
fn serve_connection(stream: Stream, provider: &PerfProvider) -> Result<()> {
    use super::protocol::{read_message, write_frame};

    let mut reader = BufReader::new(stream);
    while let Some(request) = read_message::<_, CollectRequest>(&mut reader)? {
        let response: Vec<u8> = respond(provider, &request).try_into()?;
        write_frame(reader.get_mut(), &response)?;
    }
    Ok(())
}

#[cfg(not(feature = "tokio"))]
fn run_server(socket_path: &str, provider: &Arc<PerfProvider>) -> Result<()> {
    let listener = ListenerOptions::new()
        .name(socket_name(socket_path)?)
        .create_sync()?;
    log::debug!("serving collect calls on {socket_path}");

    for stream in listener.incoming().filter_map(handle_error) {
        let provider = provider.clone();
        thread::spawn(move || {
            if let Err(e) = serve_connection(stream, &provider) {
                log::trace!("collect connection closed: {e}");
            }
        });
    }
    Ok(())
}

#[cfg(feature = "tokio")]
async fn serve_connection(stream: LocalSocketStream, provider: Arc<PerfProvider>) -> Result<()> {
    use super::protocol::{read_frame_async, write_frame_async};
    use crate::error::RepositoryError;

    let mut stream = BufReader::new(stream);
    while let Some(frame) = read_frame_async(&mut stream).await? {
        let request = CollectRequest::try_from(&frame)?;
        let provider = provider.clone();
        let response = task::spawn_blocking(move || respond(&provider, &request))
            .await
            .map_err(|e| RepositoryError::Transport(e.to_string()))?;
        let response: Vec<u8> = response.try_into()?;
        write_frame_async(stream.get_mut(), &response).await?;
    }
    Ok(())
}

#[cfg(feature = "tokio")]
async fn run_server(socket_path: &str, provider: Arc<PerfProvider>) -> Result<()> {
    let listener = ListenerOptions::new()
        .name(socket_name(socket_path)?)
        .create_tokio()?;
    log::debug!("serving collect calls on {socket_path}");

    loop {
        match listener.accept().await {
            Ok(stream) => {
                let provider = provider.clone();
                task::spawn(async move {
                    if let Err(e) = serve_connection(stream, provider).await {
                        log::trace!("collect connection closed: {e}");
                    }
                });
            }
            Err(e) => log::warn!("Failed to accept connection: {e}"),
        }
    }
}
