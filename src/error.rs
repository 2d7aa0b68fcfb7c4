use thiserror::Error;

/// Runtime errors of the relay. None of these terminate the process:
/// malformed messages are counted and discarded, and connection errors out
/// of `start()` are retried by the caller with the same backoff policy.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("could not reach the MQTT broker after {attempts} attempts: {reason}")]
    Connection { attempts: u32, reason: String },

    #[error("topic '{0}' has no device segment")]
    MalformedTopic(String),

    #[error("payload could not be decoded: {0}")]
    MalformedPayload(#[from] serde_json::Error),
}
