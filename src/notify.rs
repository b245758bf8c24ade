//! Telegram alert sink. Fire-and-forget: failures are logged by the caller
//! and never retried.

use std::time::Duration;

use serde::Serialize;

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("telegram status {0}")]
    Status(reqwest::StatusCode),
}

pub struct Telegram {
    token: String,
    chat_id: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct TelegramPayload<'a> {
    chat_id: &'a str,
    text: &'a str,
}

impl Telegram {
    /// Returns `None` unless notifications are enabled and credentialed.
    pub fn new(enabled: bool, token: &str, chat_id: &str) -> Option<Self> {
        if !enabled || token.is_empty() || chat_id.is_empty() {
            return None;
        }
        let client = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .ok()?;
        Some(Self {
            token: token.to_string(),
            chat_id: chat_id.to_string(),
            client,
        })
    }

    pub async fn send(&self, text: &str) -> Result<(), NotifyError> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let response = self
            .client
            .post(&url)
            .json(&TelegramPayload {
                chat_id: &self.chat_id,
                text,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status()));
        }
        Ok(())
    }
}
