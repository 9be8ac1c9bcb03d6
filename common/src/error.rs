use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("conflict: file {0} already exists")]
    AlreadyExists(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid node: {0}")]
    InvalidNode(usize),
    #[error("invalid file name: {0}")]
    InvalidName(String),
    #[error("invalid priority: {0}")]
    InvalidPriority(u8),
    #[error("not enough capacity on node")]
    NoCapacity,
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),
    #[error("remote command failed on node {node}: {reason}")]
    RemoteExecFailure { node: usize, reason: String },
    #[error("bad cluster configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Any(#[from] anyhow::Error),
}

impl StoreError {
    pub fn persistence(e: impl std::fmt::Display) -> Self {
        StoreError::PersistenceFailure(e.to_string())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            StoreError::AlreadyExists(_) => StatusCode::CONFLICT,
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::InvalidNode(_) => StatusCode::BAD_REQUEST,
            StoreError::InvalidName(_) => StatusCode::BAD_REQUEST,
            StoreError::InvalidPriority(_) => StatusCode::BAD_REQUEST,
            StoreError::NoCapacity => StatusCode::INSUFFICIENT_STORAGE,
            StoreError::RemoteExecFailure { .. } => StatusCode::BAD_GATEWAY,
            StoreError::PersistenceFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            StoreError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            StoreError::Any(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for StoreError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
