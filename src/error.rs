use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = RepositoryError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("category {0} is already registered")]
    DuplicateCategory(u32),
    #[error("counter {counter} is already registered in category {category}")]
    DuplicateCounter { category: u32, counter: u32 },
    #[error("category {0} is not registered")]
    UnknownCategory(u32),
    #[error("invalid counter {counter} in category {category}: {reason}")]
    InvalidCounter {
        category: u32,
        counter: u32,
        reason: String,
    },
    #[error("schema can not change once the repository is initialized")]
    SchemaFrozen,
    #[error("schema can not be cleared while instances are alive")]
    InstancesAlive,
    #[error("repository lock not acquired within {0:?}")]
    LockTimeout(Duration),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("instance not found")]
    InstanceNotFound,
    #[error("instance {name:?} already exists in category {category}")]
    DuplicateName { category: u32, name: String },
    #[error("{len} byte access at offset {offset} is outside or misaligned in {size} bytes of counter data")]
    InvalidAccess { offset: u32, len: u32, size: u32 },
    #[error("repository is mapped read-only")]
    ReadOnly,
    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(String),
    #[error("corrupt repository: {0}")]
    CorruptRepository(String),
    #[error("repository {0} does not exist")]
    RepositoryNotFound(String),
    #[error("IO error in shared repository {0}")]
    Io(#[from] std::io::Error),
    #[error("couldnt serialize message: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),
    #[error("failed to deserialize message: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),
    #[error("collect endpoint error: {0}")]
    Transport(String),
}

impl From<quick_xml::DeError> for RepositoryError {
    fn from(err: quick_xml::DeError) -> Self {
        Self::MalformedSnapshot(err.to_string())
    }
}

impl From<quick_xml::SeError> for RepositoryError {
    fn from(err: quick_xml::SeError) -> Self {
        Self::Io(std::io::Error::other(err.to_string()))
    }
}

impl From<base64::DecodeError> for RepositoryError {
    fn from(err: base64::DecodeError) -> Self {
        Self::MalformedSnapshot(format!("counter data is not valid base64: {err}"))
    }
}
