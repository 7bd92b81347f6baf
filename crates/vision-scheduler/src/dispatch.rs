use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use std::time::Duration;
use tracing::debug;
use vision_scheduler_core::{MultipartForm, Result, SchedError};

/// Outbound side of the scheduler: commands to workers, results to clients
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// POST `form` as multipart to `url` and return the response body
    async fn post_form(&self, url: &str, form: MultipartForm) -> Result<String>;
}

/// [`Dispatcher`] over HTTP
pub struct HttpDispatcher {
    client: reqwest::Client,
}

impl HttpDispatcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SchedError::Transport(e.to_string()))?;
        Ok(HttpDispatcher { client })
    }
}

fn to_multipart(form: MultipartForm) -> Form {
    let mut multipart = Form::new();
    for (name, value) in form.fields() {
        multipart = multipart.text(name.to_string(), value.to_string());
    }
    for (name, part) in form.files() {
        let file = Part::bytes(part.data.to_vec()).file_name(part.file_name.clone());
        multipart = multipart.part(name.to_string(), file);
    }
    multipart
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn post_form(&self, url: &str, form: MultipartForm) -> Result<String> {
        debug!("POST {} ({} bytes)", url, form.payload_len());

        let response = self
            .client
            .post(url)
            .multipart(to_multipart(form))
            .send()
            .await
            .map_err(|e| SchedError::Transport(format!("{}: {}", url, e)))?
            .error_for_status()
            .map_err(|e| SchedError::Transport(format!("{}: {}", url, e)))?;

        response
            .text()
            .await
            .map_err(|e| SchedError::Transport(format!("{}: {}", url, e)))
    }
}
