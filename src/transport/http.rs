use std::io;
use std::time::Duration;

use anyhow::{anyhow, Result};
use url::Url;

use super::{UploadPayload, UploadReceipt, Uploader};
use crate::error::PipelineError;

pub const UPLOAD_PATH: &str = "api/reports/upload-detection";

/// Blocking JSON uploader over HTTP(S).
pub struct HttpUploader {
    agent: ureq::Agent,
    endpoint: Url,
    timeout: Duration,
}

impl HttpUploader {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base =
            Url::parse(base_url).map_err(|e| anyhow!("invalid upload url {}: {}", base_url, e))?;
        match base.scheme() {
            "http" | "https" => {}
            other => return Err(anyhow!("unsupported upload url scheme: {}", other)),
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base
            .join(UPLOAD_PATH)
            .map_err(|e| anyhow!("invalid upload url {}: {}", base_url, e))?;
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self {
            agent,
            endpoint,
            timeout,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

impl Uploader for HttpUploader {
    fn upload(&self, payload: &UploadPayload) -> Result<UploadReceipt, PipelineError> {
        let body = serde_json::to_string(payload).map_err(PipelineError::upload)?;
        let response = self
            .agent
            .post(self.endpoint.as_str())
            .set("Content-Type", "application/json")
            .send_string(&body)
            .map_err(|e| self.map_error(e))?;
        let text = response.into_string().map_err(|e| {
            if e.kind() == io::ErrorKind::TimedOut {
                PipelineError::UploadTimeout(self.timeout)
            } else {
                PipelineError::upload(format!("read response: {}", e))
            }
        })?;
        Ok(UploadReceipt::from_response_body(&text))
    }
}

impl HttpUploader {
    fn map_error(&self, err: ureq::Error) -> PipelineError {
        match err {
            ureq::Error::Status(code, response) => {
                let status_text = response.status_text().to_string();
                PipelineError::upload(format!("server returned {} {}", code, status_text))
            }
            ureq::Error::Transport(transport) => {
                if transport.to_string().contains("timed out") {
                    PipelineError::UploadTimeout(self.timeout)
                } else {
                    PipelineError::upload(transport)
                }
            }
        }
    }
}
