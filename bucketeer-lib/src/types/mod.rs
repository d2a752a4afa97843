#![allow(unreachable_pub)]

mod error;
mod request;
mod response;

pub use error::{ApiError, ErrorKind, HttpError, TransportError};
pub use request::{Auth, FileAttachment, Form, FormField, Method, RequestOptions};
pub use response::ResponseBody;

/// The bucketeer `Result` type
pub type Result<T> = std::result::Result<T, crate::ErrorKind>;
