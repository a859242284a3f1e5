use serde::{Deserialize, Serialize};

use orra_types::OrraError;

/// HTTP error response body: `{error: {kind, param?, message}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorDetail {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    pub message: String,
}

impl From<&OrraError> for ApiErrorBody {
    fn from(err: &OrraError) -> Self {
        ApiErrorBody {
            error: ApiErrorDetail {
                kind: err.kind().to_string(),
                param: err.param().map(str::to_string),
                message: err.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_carries_kind_and_param() {
        let err = OrraError::validation_param("name", "bad pattern");
        let body = ApiErrorBody::from(&err);
        assert_eq!(body.error.kind, "validation");
        assert_eq!(body.error.param.as_deref(), Some("name"));
    }
}
