use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use crate::config::Config;
use crate::models::FieldValue;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("sink returned status {0}")]
    Status(StatusCode),
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// The relay's entire contract with the remote store: one idempotent
/// merge-patch per device key. Fields absent from `fields` keep their
/// previous values; nothing is ever deleted by a partial update.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn merge_patch(
        &self,
        key: &str,
        fields: &HashMap<String, FieldValue>,
    ) -> Result<(), SinkError>;
}

/// Firebase-RTDB-style sink: `PATCH {base}/{prefix}/{key}.json` applies a
/// server-side merge of the posted object into the keyed record.
pub struct HttpSink {
    client: Client,
    base_url: String,
    path_prefix: String,
    auth_token: Option<String>,
}

impl HttpSink {
    pub fn new(
        base_url: &str,
        path_prefix: &str,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, SinkError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            path_prefix: path_prefix.trim_matches('/').to_string(),
            auth_token,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, SinkError> {
        Self::new(
            &config.sink_base_url,
            &config.sink_path_prefix,
            config.sink_auth_token.clone(),
            Duration::from_millis(config.sink_timeout_ms),
        )
    }

    fn record_url(&self, key: &str) -> String {
        let mut url = format!("{}/{}/{}.json", self.base_url, self.path_prefix, key);
        if let Some(token) = &self.auth_token {
            url.push_str("?auth=");
            url.push_str(token);
        }
        url
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn merge_patch(
        &self,
        key: &str,
        fields: &HashMap<String, FieldValue>,
    ) -> Result<(), SinkError> {
        let response = self
            .client
            .patch(self.record_url(key))
            .json(fields)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(SinkError::Status(status))
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_url_joins_base_prefix_and_key() {
        let sink = HttpSink::new(
            "https://farm-rtdb.example.com/",
            "/sensors/",
            None,
            Duration::from_secs(10),
        )
        .unwrap();
        assert_eq!(
            sink.record_url("node1"),
            "https://farm-rtdb.example.com/sensors/node1.json"
        );
    }

    #[test]
    fn record_url_appends_auth_token() {
        let sink = HttpSink::new(
            "https://farm-rtdb.example.com",
            "sensors",
            Some("secret".to_string()),
            Duration::from_secs(10),
        )
        .unwrap();
        assert_eq!(
            sink.record_url("node1"),
            "https://farm-rtdb.example.com/sensors/node1.json?auth=secret"
        );
    }
}
