use rollcall_core::NoMatchReason;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct UploadImageRequest {
    /// Base64 image, optionally wrapped in a `data:` URL.
    pub image: String,
}

#[derive(Debug, Serialize)]
pub struct UploadImageResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<NoMatchReason>,
}

impl UploadImageResponse {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            identity: None,
            confidence: None,
            reason: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnrollRequest {
    pub label: String,
    pub images: Vec<String>,
    #[serde(default)]
    pub append: bool,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: &'static str,
    pub metric: &'static str,
    pub threshold: f32,
    pub margin: f32,
    pub identities: usize,
    pub generation: u64,
}

#[derive(Debug, Deserialize)]
pub struct AttendanceQuery {
    pub date: Option<String>,
}
