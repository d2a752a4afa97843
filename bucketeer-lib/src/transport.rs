//! The HTTP collaborator the dispatcher issues attempts through.
//!
//! The dispatcher only needs "send this, give me status, headers and text".
//! [`ReqwestTransport`] is the default; tests and embedders can plug in
//! anything else that implements [`Transport`].

use async_trait::async_trait;
use http::{HeaderMap, StatusCode};
use reqwest::multipart;
use url::Url;

use crate::{Form, FormField, Method, types::TransportError};

/// A serialized request body.
///
/// Kept as plain data so the same body can be sent again on retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    /// An encoded JSON document
    Json(String),
    /// A multipart form
    Form(Form),
}

/// One attempt, fully prepared by the dispatcher
#[derive(Debug, Clone)]
pub struct TransportRequest {
    /// Request method
    pub method: Method,
    /// Absolute URL
    pub url: Url,
    /// Headers, including authorization and content type
    pub headers: HeaderMap,
    /// Body, never present for `GET`
    pub body: Option<RequestBody>,
}

/// What came back from the server
#[derive(Debug, Clone)]
pub struct TransportResponse {
    /// Response status
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body read as text
    pub body: String,
}

/// Sends prepared requests. Timeouts are enforced by the dispatcher around
/// [`Transport::send`], so implementations need not enforce their own.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Send `request` and read the full response
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

/// [`Transport`] backed by a [`reqwest::Client`]
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Use `client` for all requests
    #[must_use]
    pub const fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let TransportRequest {
            method,
            url,
            headers,
            body,
        } = request;

        let mut builder = self.client.request(method.into(), url).headers(headers);
        builder = match body {
            Some(RequestBody::Json(json)) => builder.body(json),
            Some(RequestBody::Form(form)) => builder.multipart(multipart_form(form)),
            None => builder,
        };

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

fn multipart_form(form: Form) -> multipart::Form {
    form.fields()
        .fold(multipart::Form::new(), |multipart, (name, field)| {
            match field {
                FormField::Text(value) => multipart.text(name.to_owned(), value.clone()),
                FormField::File(file) => multipart.part(
                    name.to_owned(),
                    multipart::Part::bytes(file.contents.clone()).file_name(file.name.clone()),
                ),
            }
        })
}
