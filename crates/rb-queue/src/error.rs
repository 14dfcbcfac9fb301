use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("SQS error: {0}")]
    Sqs(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("queue does not exist: {0}")]
    QueueMissing(String),

    #[error("queue creation failed: {0}")]
    Creation(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("legacy driver error: {0}")]
    Legacy(String),

    #[error("configuration error: {0}")]
    Config(String),
}
