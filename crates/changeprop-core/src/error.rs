use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("invalid rule {rule}: {reason}")]
    InvalidRule { rule: String, reason: String },

    #[error("template error: {0}")]
    Template(String),

    #[error("kafka error: {0}")]
    Kafka(String),

    #[error("failed to produce to {topic}: {reason}")]
    Produce { topic: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn invalid_rule(rule: &str, reason: impl Into<String>) -> Self {
        Error::InvalidRule {
            rule: rule.to_string(),
            reason: reason.into(),
        }
    }

    pub fn produce(topic: &str, reason: impl std::fmt::Display) -> Self {
        Error::Produce {
            topic: topic.to_string(),
            reason: reason.to_string(),
        }
    }
}
