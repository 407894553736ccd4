//! HTTP plumbing shared by the collaborator clients (tickets, test records,
//! metrics collector, project directory).
//!
//! Every collaborator answers with the platform envelope
//! `{"success": bool, "data": ..., "err": {"code": ..., "msg": ...}}`.
use reqwest::{Method, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("not found")]
    NotFound,
    #[error("unexpected status {0}")]
    Status(StatusCode),
    #[error("remote error {code}: {msg}")]
    Remote { code: String, msg: String },
    #[error("response carried no data")]
    MissingData,
    #[error("{0}")]
    Unavailable(String),
}

#[derive(Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    data: Option<T>,
    err: Option<EnvelopeError>,
}

#[derive(Deserialize, Default)]
struct EnvelopeError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    msg: String,
}

#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpClient {
    pub fn new(base_url: &Url, timeout: Duration) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpClient {
            client,
            base_url: base_url.as_str().trim_end_matches('/').to_string(),
        })
    }

    pub fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, ClientError> {
        let url = Url::parse(&format!(
            "{}/{}",
            self.base_url,
            path.trim_start_matches('/')
        ))?;
        Ok(self.client.request(method, url))
    }

    /// Sends the request and unwraps the envelope. `Ok(None)` means the call
    /// succeeded without a payload.
    pub async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<Option<T>, ClientError> {
        let response = request.send().await?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => return Err(ClientError::NotFound),
            status => {
                // Error bodies usually carry the envelope; fall back to the status.
                return match response.json::<Envelope<serde_json::Value>>().await {
                    Ok(Envelope { err: Some(err), .. }) => Err(ClientError::Remote {
                        code: err.code,
                        msg: err.msg,
                    }),
                    _ => Err(ClientError::Status(status)),
                };
            }
        }

        let envelope = response.json::<Envelope<T>>().await?;
        if !envelope.success {
            let err = envelope.err.unwrap_or_default();
            return Err(ClientError::Remote {
                code: err.code,
                msg: err.msg,
            });
        }

        Ok(envelope.data)
    }

    pub async fn send_for_data<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, ClientError> {
        self.send(request).await?.ok_or(ClientError::MissingData)
    }
}
