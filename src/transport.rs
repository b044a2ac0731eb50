//! A local socket endpoint that serves collect calls to other processes.
//!
//! Every message is a little-endian `u32` length followed by an
//! `rmp-serde` encoded [`CollectRequest`] or [`CollectResponse`].

mod client;
mod protocol;
mod socket;

pub use client::{CollectClient, CollectReply};
pub use protocol::{CollectRequest, CollectResponse};
pub use socket::CollectServer;

use interprocess::local_socket::{GenericFilePath, GenericNamespaced, Name, prelude::*};

pub const DEFAULT_SOCKET: &str = "metrics_shm_repository.sock";

/// Collect buffers are capped so a single response always fits in a frame.
pub const MAX_BUFFER_SIZE: u32 = 16 * 1024 * 1024;

fn socket_name(socket_path: &str) -> std::io::Result<Name<'static>> {
    if GenericNamespaced::is_supported() {
        socket_path.to_string().to_ns_name::<GenericNamespaced>()
    } else {
        format!("/tmp/{socket_path}").to_fs_name::<GenericFilePath>()
    }
}
