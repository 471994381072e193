//! Wire models shared by the REST handlers

use serde::{Deserialize, Serialize};

/// Uniform REST envelope: `{ success, data?, error? }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

/// Error payload inside the envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>, code: Option<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiError {
                message: message.into(),
                code,
                details: None,
            }),
        }
    }
}

/// `GET /api/v1/info`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoResponse {
    pub version: String,
    pub listen_addr: String,
    pub endpoints: Endpoints,
    pub update: Option<UpdateInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoints {
    pub http: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket: Option<String>,
}

/// Update-checker block. The checker itself is an external collaborator;
/// the daemon only reports what it last learned, honoring
/// `MCPPROXY_DISABLE_AUTO_UPDATE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UpdateInfo {
    pub available: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub checked_at: Option<chrono::DateTime<chrono::Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_prerelease: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shapes() {
        let ok: ApiResponse<u32> = ApiResponse::ok(7);
        let value = serde_json::to_value(&ok).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["data"], 7);
        assert!(value.get("error").is_none());

        let err: ApiResponse<u32> = ApiResponse::err("nope", Some("NOT_FOUND".into()));
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["error"]["code"], "NOT_FOUND");
        assert!(value.get("data").is_none());
    }
}
