use std::{fmt, path::Path, str::FromStr};

use secrecy::SecretString;
use typed_builder::TypedBuilder;

use crate::ErrorKind;

/// HTTP verbs the remote API accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// `GET`
    Get,
    /// `POST`
    Post,
    /// `PUT`
    Put,
    /// `PATCH`
    Patch,
    /// `DELETE`
    Delete,
}

impl Method {
    /// The canonical upper-case verb
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl FromStr for Method {
    type Err = ErrorKind;

    fn from_str(method: &str) -> Result<Self, Self::Err> {
        match method.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            _ => Err(ErrorKind::InvalidMethod(method.to_owned())),
        }
    }
}

impl From<Method> for http::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => http::Method::GET,
            Method::Post => http::Method::POST,
            Method::Put => http::Method::PUT,
            Method::Patch => http::Method::PATCH,
            Method::Delete => http::Method::DELETE,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which `Authorization` value, if any, a request carries
#[derive(Debug, Clone, Default)]
pub enum Auth {
    /// Send no `Authorization` header
    #[default]
    None,
    /// Use the token the dispatcher was built with
    Default,
    /// Use this exact header value (including any scheme prefix)
    Token(SecretString),
}

impl Auth {
    /// Authenticated requests are subject to the global lockout
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        !matches!(self, Self::None)
    }
}

impl From<bool> for Auth {
    fn from(auth: bool) -> Self {
        if auth { Self::Default } else { Self::None }
    }
}

impl From<SecretString> for Auth {
    fn from(token: SecretString) -> Self {
        Self::Token(token)
    }
}

/// A file uploaded as part of a multipart request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttachment {
    /// File name reported to the server
    pub name: String,
    /// Raw file contents
    pub contents: Vec<u8>,
}

impl FileAttachment {
    /// Create a new attachment
    pub fn new(name: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            contents: contents.into(),
        }
    }

    /// Read an attachment from disk, named after the file
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::ReadAttachment`] if the file cannot be read.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, ErrorKind> {
        let path = path.as_ref();
        let contents = tokio::fs::read(path)
            .await
            .map_err(|e| ErrorKind::ReadAttachment(path.to_path_buf(), e))?;
        let name = path
            .file_name()
            .map_or_else(|| "file".into(), |name| name.to_string_lossy().into_owned());
        Ok(Self { name, contents })
    }
}

/// One value of a multipart [`Form`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormField {
    /// A plain text field
    Text(String),
    /// A file field
    File(FileAttachment),
}

/// A multipart form body.
///
/// Unlike `reqwest::multipart::Form` this is plain data, so the same form can
/// be encoded again when an attempt is retried. Field names are unique;
/// [`Form::set`] replaces an existing field of the same name in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Form {
    fields: Vec<(String, FormField)>,
}

impl Form {
    /// Create an empty form
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a text field
    #[must_use]
    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, FormField::Text(value.into()));
        self
    }

    /// Set a file field
    #[must_use]
    pub fn file(mut self, name: impl Into<String>, file: FileAttachment) -> Self {
        self.set(name, FormField::File(file));
        self
    }

    /// Insert a field, replacing any field with the same name
    pub fn set(&mut self, name: impl Into<String>, field: FormField) {
        let name = name.into();
        match self.fields.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, value)) => *value = field,
            None => self.fields.push((name, field)),
        }
    }

    /// All fields in insertion order
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FormField)> {
        self.fields.iter().map(|(name, field)| (name.as_str(), field))
    }

    /// Look up a field by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FormField> {
        self.fields
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, field)| field)
    }

    /// Whether the form has no fields
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Everything needed to issue one request through the dispatcher.
///
/// ```
/// use bucketeer_lib::{Auth, RequestOptions};
///
/// let options = RequestOptions::builder()
///     .method("post")
///     .path("/channels/123456789012345678/messages")
///     .json(serde_json::json!({ "content": "hello" }))
///     .auth(Auth::Default)
///     .build();
/// assert_eq!(options.method, "post");
/// ```
#[derive(TypedBuilder, Debug, Clone)]
#[builder(field_defaults(default, setter(into)))]
pub struct RequestOptions {
    /// HTTP verb, case-insensitive. Validated when the request is issued
    #[builder(!default)]
    pub method: String,
    /// Path below the base URL; a missing leading `/` is added
    #[builder(!default)]
    pub path: String,
    /// JSON body. With files it is sent as the `payload_json` form field
    #[builder(setter(strip_option))]
    pub json: Option<serde_json::Value>,
    /// Files to upload as `files[i]` multipart fields
    pub files: Vec<FileAttachment>,
    /// Pre-built multipart body. Files and JSON are added to it if present
    #[builder(setter(strip_option))]
    pub form: Option<Form>,
    /// Audit log reason, sent as `X-Audit-Log-Reason`
    #[builder(setter(strip_option))]
    pub reason: Option<String>,
    /// Explicit route key, bypassing the computed one
    #[builder(setter(strip_option))]
    pub route: Option<String>,
    /// Authorization to send
    pub auth: Auth,
    /// Jump to the front of the bucket and global queues
    pub priority: bool,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("GET", Method::Get)]
    #[case("get", Method::Get)]
    #[case("Patch", Method::Patch)]
    #[case("delete", Method::Delete)]
    fn test_method_is_case_insensitive(#[case] input: &str, #[case] expected: Method) {
        assert_eq!(input.parse::<Method>().unwrap(), expected);
    }

    #[rstest]
    #[case("HEAD")]
    #[case("TRACE")]
    #[case("")]
    fn test_unsupported_method(#[case] input: &str) {
        assert!(matches!(
            input.parse::<Method>(),
            Err(ErrorKind::InvalidMethod(m)) if m == input
        ));
    }

    #[test]
    fn test_auth_modes() {
        assert!(!Auth::None.is_authenticated());
        assert!(Auth::Default.is_authenticated());
        assert!(Auth::from(SecretString::from("Bot abc")).is_authenticated());
        assert!(matches!(Auth::from(false), Auth::None));
    }

    #[tokio::test]
    async fn test_attachment_from_path() {
        let path = test_utils::root_path!().join("README.md");
        let attachment = FileAttachment::from_path(&path).await.unwrap();
        assert_eq!(attachment.name, "README.md");
        assert!(!attachment.contents.is_empty());

        let missing = FileAttachment::from_path("does-not-exist.png").await;
        assert!(matches!(missing, Err(ErrorKind::ReadAttachment(..))));
    }

    #[test]
    fn test_form_set_replaces_in_place() {
        let mut form = Form::new()
            .text("payload_json", "{}")
            .file("files[0]", FileAttachment::new("a.txt", "a"));
        form.set("payload_json", FormField::Text("{\"a\":1}".into()));

        let names: Vec<_> = form.fields().map(|(name, _)| name).collect();
        assert_eq!(names, ["payload_json", "files[0]"]);
        assert_eq!(
            form.get("payload_json"),
            Some(&FormField::Text("{\"a\":1}".into()))
        );
    }
}
