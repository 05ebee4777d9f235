use std::time::Duration;

use serde_json::Value;

use crate::error::LLMError;

pub(crate) struct HTTPRequest {}

impl HTTPRequest {
    /// POST a JSON body and return the response text.
    ///
    /// Non-success statuses are classified through [`LLMError::from_status`].
    pub async fn request_with_headers(
        client: &reqwest::Client,
        url: &str,
        body: &Value,
        headers: &[(&str, String)],
        timeout: Option<Duration>,
    ) -> Result<String, LLMError> {
        let mut builder = client.post(url).json(body);
        for (name, value) in headers {
            builder = builder.header(*name, value);
        }
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(LLMError::from_status(status.as_u16(), text));
        }
        Ok(text)
    }
}
