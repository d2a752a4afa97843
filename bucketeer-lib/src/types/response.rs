use std::fmt::Display;

use http::StatusCode;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

/// A parsed response body, as handed back to callers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResponseBody {
    /// No content (status 204)
    Empty,
    /// The server declared JSON and the body parsed as such
    Json(Value),
    /// Anything else, including JSON that failed to parse
    Text(String),
}

impl ResponseBody {
    /// Interpret a raw body.
    ///
    /// A body declared as JSON that does not parse is kept as text; the parse
    /// error is handed back so it can be reported without failing the request.
    pub(crate) fn parse(
        status: StatusCode,
        content_type: Option<&str>,
        text: String,
    ) -> (Self, Option<serde_json::Error>) {
        if status == StatusCode::NO_CONTENT {
            return (Self::Empty, None);
        }
        if !content_type.is_some_and(is_json_content_type) {
            return (Self::Text(text), None);
        }
        match serde_json::from_str(&text) {
            Ok(value) => (Self::Json(value), None),
            Err(e) => (Self::Text(text), Some(e)),
        }
    }

    /// Whether the response had no content
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// The JSON value, if the body was JSON
    #[must_use]
    pub const fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Deserialize a JSON body into `T`. Empty bodies deserialize from
    /// `null`, text bodies from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the body does not have the shape of `T`.
    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        match self {
            Self::Empty => serde_json::from_value(Value::Null),
            Self::Json(value) => T::deserialize(value),
            Self::Text(text) => serde_json::from_value(Value::String(text.clone())),
        }
    }

    /// Machine-readable error code of a structured error payload
    pub(crate) fn error_code(&self) -> Option<i64> {
        self.as_json()?.get("code")?.as_i64()
    }

    /// `retry_after` field of a rate limit payload, in seconds
    pub(crate) fn retry_after(&self) -> Option<f64> {
        self.as_json()?.get("retry_after")?.as_f64()
    }
}

impl Display for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => Ok(()),
            Self::Json(value) => write!(f, "{value}"),
            Self::Text(text) => f.write_str(text),
        }
    }
}

fn is_json_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"))
}
