use thiserror::Error;

/// Errors that stop the sonar ingestion service from starting or serving.
#[derive(Error, Debug)]
pub enum SonarIngestError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] crate::config::ValidationError),

    #[error("Scan store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("Collaborator client error: {0}")]
    Client(#[from] crate::client::ClientError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
