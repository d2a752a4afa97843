//! The request dispatcher.
//!
//! This module defines [`DispatcherBuilder`] and [`RequestDispatcher`].
//! `RequestDispatcher` takes requests from any number of concurrent callers,
//! serializes them per route key and retries rate limited and transient
//! failures until a terminal outcome can be handed back.
#![allow(clippy::module_name_repetitions)]

use std::backtrace::Backtrace;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use http::header::{self, HeaderMap, HeaderValue};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::broadcast;
use typed_builder::TypedBuilder;
use url::Url;

use crate::events::{Event, Events, RawRequest};
use crate::ratelimit::headers::{GLOBAL, LIMIT, REMAINING, RESET};
use crate::ratelimit::{
    Admission, BucketSnapshot, GlobalLock, LatencyRef, RateLimitConfig, RateLimitHeaders,
    RouteBucket, now_millis,
};
use crate::retry::{BadGatewayBudget, Disposition, RetryExt, bad_gateway_backoff, find_source};
use crate::{
    ApiError, Auth, ErrorKind, FormField, HttpError, Method, RequestBody, RequestOptions,
    ReqwestTransport, ResponseBody, Result, RouteKey, Transport, TransportRequest,
    TransportResponse,
};

/// Default API root requests are sent to
pub const DEFAULT_BASE_URL: &str = "https://discord.com/api/v10";

/// Default time a single attempt may take, 15 seconds
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default user agent, `DiscordBot (bucketeer, <PKG_VERSION>)`
pub const DEFAULT_USER_AGENT: &str =
    concat!("DiscordBot (bucketeer, ", env!("CARGO_PKG_VERSION"), ")");

/// Characters `encodeURIComponent` escapes: everything except
/// `A-Z a-z 0-9 - _ . ! ~ * ' ( )`
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

const AUDIT_LOG_REASON: &str = "x-audit-log-reason";

/// Builder for [`RequestDispatcher`].
///
/// ```
/// use bucketeer_lib::{DispatcherBuilder, RateLimitConfig};
/// use std::time::Duration;
///
/// let dispatcher = DispatcherBuilder::builder()
///     .token(secrecy::SecretString::from("Bot MTk4NjIyNDgzNDcxOTI1MjQ4.Cl2FMQ.ZnCjm1XVW7vRze4b7Cq4se7kKWs"))
///     .timeout(Duration::from_secs(5))
///     .rate_limit_config(RateLimitConfig {
///         ratelimiter_offset: Duration::from_millis(50),
///         ..RateLimitConfig::default()
///     })
///     .build()
///     .dispatcher()
///     .unwrap();
/// assert!(!dispatcher.is_globally_locked());
/// ```
#[derive(TypedBuilder, Debug, Clone)]
#[builder(field_defaults(default, setter(into)))]
#[builder(builder_method(doc = "
Create a builder for building `DispatcherBuilder`.

On the builder call, call methods with same name as its fields to set their values.

Finally, call `.build()` to create the instance of `DispatcherBuilder`.
"))]
pub struct DispatcherBuilder {
    /// API root every request path is appended to. A trailing `/` is removed.
    #[builder(default_code = "String::from(DEFAULT_BASE_URL)")]
    base_url: String,
    /// Authorization value used by requests with [`Auth::Default`],
    /// including its scheme prefix (e.g. `Bot ...`).
    token: Option<SecretString>,
    /// Time a single attempt may take. `None` or zero disables the timeout.
    #[builder(default = Some(DEFAULT_TIMEOUT))]
    timeout: Option<Duration>,
    /// Overrides the `Host` header of every request.
    host: Option<String>,
    /// User agent sent with every request.
    #[builder(default_code = "String::from(DEFAULT_USER_AGENT)")]
    user_agent: String,
    /// HTTP client for the default transport, e.g. to route through a proxy
    /// or tune connection pooling.
    client: Option<reqwest::Client>,
    /// Replaces the default `reqwest` transport entirely. Takes precedence
    /// over `client`.
    transport: Option<Arc<dyn Transport>>,
    /// Rate limiting knobs.
    rate_limit_config: RateLimitConfig,
}

impl Default for DispatcherBuilder {
    #[inline]
    fn default() -> Self {
        Self::builder().build()
    }
}

impl DispatcherBuilder {
    /// Instantiates a [`RequestDispatcher`].
    ///
    /// # Errors
    ///
    /// Returns an `Err` if:
    /// - The base URL does not parse.
    /// - The user agent or host override is not a valid header value.
    /// - The request client cannot be created.
    ///   See [here](https://docs.rs/reqwest/latest/reqwest/struct.ClientBuilder.html#errors).
    pub fn dispatcher(self) -> Result<RequestDispatcher> {
        let base_url = self.base_url.trim_end_matches('/').to_owned();
        Url::parse(&base_url).map_err(|e| ErrorKind::InvalidBaseUrl(base_url.clone(), e))?;

        let user_agent = HeaderValue::from_str(&self.user_agent)?;
        let host = self
            .host
            .as_deref()
            .map(HeaderValue::from_str)
            .transpose()?;

        let transport: Arc<dyn Transport> = match (self.transport, self.client) {
            (Some(transport), _) => transport,
            (None, Some(client)) => Arc::new(ReqwestTransport::new(client)),
            (None, None) => Arc::new(ReqwestTransport::new(
                reqwest::Client::builder()
                    .build()
                    .map_err(ErrorKind::BuildRequestClient)?,
            )),
        };

        let latency = Arc::new(LatencyRef::new(&self.rate_limit_config));

        Ok(RequestDispatcher {
            inner: Arc::new(Inner {
                base_url,
                token: self.token,
                timeout: self.timeout.filter(|t| !t.is_zero()),
                host,
                user_agent,
                transport,
                config: self.rate_limit_config,
                buckets: DashMap::new(),
                global: Arc::new(GlobalLock::default()),
                latency,
                events: Events::default(),
            }),
        })
    }
}

/// Issues requests against a rate limited API.
///
/// Cloning is cheap; clones share route buckets, the global lockout and
/// latency estimates. See [`DispatcherBuilder`] for configuration.
#[derive(Debug, Clone)]
pub struct RequestDispatcher {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    base_url: String,
    token: Option<SecretString>,
    timeout: Option<Duration>,
    host: Option<HeaderValue>,
    user_agent: HeaderValue,
    transport: Arc<dyn Transport>,
    config: RateLimitConfig,
    /// Route key to bucket. Buckets are created on first use and never evicted
    buckets: DashMap<String, Arc<RouteBucket>>,
    global: Arc<GlobalLock>,
    latency: Arc<LatencyRef>,
    events: Events,
}

/// Everything about one caller's request that stays fixed across attempts
struct Prepared {
    method: Method,
    path: String,
    route: String,
    url: Url,
    headers: HeaderMap,
    body: Option<RequestBody>,
    authenticated: bool,
    priority: bool,
    call_site: Arc<Backtrace>,
}

impl RequestDispatcher {
    /// Issue a request and wait for its terminal outcome.
    ///
    /// Rate limited responses are retried after the delay the server asks
    /// for, 502s a bounded number of times with random backoff. Everything
    /// else resolves or rejects right away.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::InvalidMethod`] for unsupported verbs, before any I/O
    /// - [`ErrorKind::Timeout`] if an attempt exceeds the configured timeout
    /// - [`ErrorKind::Transport`] if the transport fails
    /// - [`ErrorKind::TransientServerError`] once 502 retries are exhausted
    /// - [`ErrorKind::Api`] or [`ErrorKind::Http`] for any other status above 300
    pub async fn request(&self, options: RequestOptions) -> Result<ResponseBody> {
        let call_site = Arc::new(Backtrace::capture());
        let prepared = self.prepare(options, call_site)?;
        self.dispatch(prepared).await
    }

    /// Same as [`RequestDispatcher::request`], with [`Auth::Default`]
    ///
    /// # Errors
    ///
    /// See [`RequestDispatcher::request`].
    pub async fn auth_request(&self, mut options: RequestOptions) -> Result<ResponseBody> {
        options.auth = Auth::Default;
        self.request(options).await
    }

    /// Receive [`Event`]s from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// Quota state of the bucket for `route`, if that route was ever used
    #[must_use]
    pub fn bucket_snapshot(&self, route: &str) -> Option<BucketSnapshot> {
        self.inner.buckets.get(route).map(|bucket| bucket.snapshot())
    }

    /// Current round trip latency estimate
    #[must_use]
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.inner.latency.latency().max(0).unsigned_abs())
    }

    /// Whether a global rate limit currently holds back authenticated requests
    #[must_use]
    pub fn is_globally_locked(&self) -> bool {
        self.inner.global.is_locked()
    }

    fn prepare(&self, options: RequestOptions, call_site: Arc<Backtrace>) -> Result<Prepared> {
        let method: Method = options.method.parse()?;
        let path = if options.path.starts_with('/') {
            options.path.clone()
        } else {
            format!("/{}", options.path)
        };
        let route = match &options.route {
            Some(route) => route.clone(),
            None => {
                let now = now_millis() - self.inner.latency.latency();
                RouteKey::new(method, &path, now).to_string()
            }
        };

        let full_url = format!("{}{path}", self.inner.base_url);
        let url = Url::parse(&full_url).map_err(|e| ErrorKind::InvalidBaseUrl(full_url, e))?;
        let body = encode_body(method, &options)?;
        let headers = self.headers(&options, body.as_ref())?;

        Ok(Prepared {
            method,
            path,
            route,
            url,
            headers,
            body,
            authenticated: options.auth.is_authenticated(),
            priority: options.priority,
            call_site,
        })
    }

    fn headers(&self, options: &RequestOptions, body: Option<&RequestBody>) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, self.inner.user_agent.clone());

        let authorization = match &options.auth {
            Auth::None => None,
            Auth::Default => self.inner.token.as_ref(),
            Auth::Token(token) => Some(token),
        };
        if let Some(token) = authorization {
            let mut value = HeaderValue::from_str(token.expose_secret())?;
            value.set_sensitive(true);
            headers.insert(header::AUTHORIZATION, value);
        }

        if let Some(reason) = &options.reason {
            let encoded = utf8_percent_encode(reason, URI_COMPONENT).to_string();
            headers.insert(AUDIT_LOG_REASON, HeaderValue::from_str(&encoded)?);
        }

        if matches!(body, Some(RequestBody::Json(_))) {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
        }

        if let Some(host) = &self.inner.host {
            headers.insert(header::HOST, host.clone());
        }
        Ok(headers)
    }

    fn bucket(&self, route: &str) -> Arc<RouteBucket> {
        if let Some(bucket) = self.inner.buckets.get(route) {
            return Arc::clone(bucket.value());
        }
        let bucket = self
            .inner
            .buckets
            .entry(route.to_owned())
            .or_insert_with(|| Arc::new(RouteBucket::new(Arc::clone(&self.inner.latency))));
        Arc::clone(bucket.value())
    }

    /// Authenticated attempts line up behind a global lockout
    fn admit(&self, bucket: &Arc<RouteBucket>, request: &Prepared) -> Admission {
        if request.authenticated {
            self.inner.global.admit(bucket, request.priority)
        } else {
            Admission::Queued(bucket.enqueue(request.priority))
        }
    }

    async fn dispatch(&self, request: Prepared) -> Result<ResponseBody> {
        let inner = &self.inner;
        let bucket = self.bucket(&request.route);
        let mut bad_gateway = BadGatewayBudget::new(inner.config.max_bad_gateway_retries);

        loop {
            let mut admission = self.admit(&bucket, &request);
            let lease = loop {
                let lease = admission.lease().await;
                if !request.authenticated {
                    break lease;
                }
                // A global limit may have hit while this attempt sat in the bucket
                match inner.global.repark(&bucket, request.priority, lease) {
                    Ok(parked) => admission = parked,
                    Err(lease) => break lease,
                }
            };

            let started = Instant::now();
            let response = match self.send(&request).await {
                Ok(response) => response,
                Err(e) => {
                    lease.release();
                    return Err(e);
                }
            };
            let round_trip = started.elapsed();
            let latency = inner.latency.record_round_trip(round_trip);

            let TransportResponse {
                status,
                headers: response_headers,
                body: text,
            } = response;
            let content_type = response_headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok());
            let (body, parse_error) = ResponseBody::parse(status, content_type, text);
            if let Some(source) = parse_error {
                inner.events.error(ErrorKind::BodyParse {
                    method: request.method,
                    route: request.route.clone(),
                    source,
                });
            }
            inner.events.request(|| RawRequest {
                method: request.method,
                path: request.path.clone(),
                route: request.route.clone(),
                with_auth: request.authenticated,
                request_body: request.body.clone(),
                response_body: body.clone(),
            });

            let limits = RateLimitHeaders::from_headers(&response_headers);
            let now = now_millis();
            if let Some(server_now) = limits.date_millis()
                && let Some(warning) = inner.latency.record_server_date(server_now, now)
            {
                inner.events.warn(warning);
            }

            let before = bucket.snapshot();
            if request.method != Method::Get
                && !limits.has_quota
                && limits.limit.unwrap_or(before.limit) != 1
            {
                inner.events.debug(|| {
                    missing_headers_report(&request, status, &response_headers, &before)
                });
            }

            if limits.global {
                inner
                    .global
                    .lock_for(limits.reset_after.unwrap_or(Duration::ZERO));
            }
            let snapshot = bucket.update_quota(
                &limits,
                &request.route,
                now,
                inner.config.reaction_reset_quirk,
            );
            let round_trip_ms = round_trip.as_millis();

            // Let the next attempt in this bucket start while this one decides
            lease.release();

            let disposition = status.disposition();
            if disposition != Disposition::RateLimited {
                inner.events.debug(|| {
                    format!(
                        "{now} {} {status}: {round_trip_ms}ms ({latency}ms avg) | {}/{} left | Reset {} ({}ms left)",
                        request.route,
                        snapshot.remaining,
                        snapshot.limit,
                        snapshot.reset,
                        snapshot.reset - now,
                    )
                });
            }

            match disposition {
                Disposition::Resolve => return Ok(body),
                Disposition::RateLimited => {
                    let delay = if limits.is_shared_scope() {
                        body.retry_after()
                            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                            .or(limits.reset_after)
                    } else {
                        limits.reset_after
                    };
                    inner.events.debug(|| {
                        format!(
                            "{} RateLimit: {body}\n{now} {} {status}: {round_trip_ms}ms ({latency}ms avg) | {}/{} left | Reset {}ms ({}ms left) | Scope {}",
                            if limits.global { "Global" } else { "Unexpected" },
                            request.route,
                            snapshot.remaining,
                            snapshot.limit,
                            delay.unwrap_or_default().as_millis(),
                            snapshot.reset - now,
                            limits.scope.as_deref().unwrap_or("none"),
                        )
                    });
                    if let Some(delay) = delay.filter(|d| !d.is_zero()) {
                        tokio::time::sleep(delay).await;
                    }
                }
                Disposition::BadGateway => {
                    if !bad_gateway.try_retry() {
                        return Err(ErrorKind::TransientServerError {
                            attempts: bad_gateway.attempts(),
                            error: Box::new(http_error(&request, status, body)),
                        });
                    }
                    inner.events.debug(|| {
                        format!("Unexpected 502 on {} {}", request.method, request.route)
                    });
                    tokio::time::sleep(bad_gateway_backoff()).await;
                }
                Disposition::Reject => return Err(rejection(&request, status, body)),
            }
        }
    }

    /// Run one transport call under the configured timeout
    async fn send(&self, request: &Prepared) -> Result<TransportResponse> {
        let inner = &self.inner;
        let attempt = inner.transport.send(TransportRequest {
            method: request.method,
            url: request.url.clone(),
            headers: request.headers.clone(),
            body: request.body.clone(),
        });

        let result = match inner.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, attempt).await {
                Ok(result) => result,
                Err(_) => {
                    inner.events.error(self.timeout_error(request));
                    return Err(self.timeout_error(request));
                }
            },
            None => attempt.await,
        };

        result.map_err(|source| {
            if is_timeout(source.as_ref()) {
                inner.events.error(self.timeout_error(request));
                return self.timeout_error(request);
            }
            inner.events.error(ErrorKind::Transport {
                method: request.method,
                path: request.path.clone(),
                source: source.to_string().into(),
            });
            ErrorKind::Transport {
                method: request.method,
                path: request.path.clone(),
                source,
            }
        })
    }

    fn timeout_error(&self, request: &Prepared) -> ErrorKind {
        ErrorKind::Timeout {
            timeout: self.inner.timeout.unwrap_or_default(),
            method: request.method,
            path: request.path.clone(),
        }
    }
}

/// The transport's own client gave up waiting
fn is_timeout(source: &(dyn std::error::Error + Send + Sync + 'static)) -> bool {
    find_source::<reqwest::Error>(source).is_some_and(reqwest::Error::is_timeout)
}

/// Serialize the request body. `GET` never carries one; JSON wins over a
/// bare form, and with files everything goes into the (possibly pre-built)
/// form.
fn encode_body(method: Method, options: &RequestOptions) -> Result<Option<RequestBody>> {
    if method == Method::Get {
        return Ok(None);
    }
    let json = options
        .json
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(ErrorKind::Serialize)?;

    if !options.files.is_empty() {
        let mut form = options.form.clone().unwrap_or_default();
        for (index, file) in options.files.iter().enumerate() {
            if file.contents.is_empty() {
                continue;
            }
            form.set(format!("files[{index}]"), FormField::File(file.clone()));
        }
        if let Some(json) = json {
            form.set("payload_json", FormField::Text(json));
        }
        return Ok(Some(RequestBody::Form(form)));
    }

    Ok(json
        .map(RequestBody::Json)
        .or_else(|| options.form.clone().map(RequestBody::Form)))
}

fn rejection(request: &Prepared, status: http::StatusCode, body: ResponseBody) -> ErrorKind {
    let Some(code) = body.error_code() else {
        return http_error(request, status, body).into();
    };
    let payload = body.as_json().cloned().unwrap_or_default();
    let message = payload
        .get("message")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_owned();
    ApiError {
        status,
        code,
        message,
        method: request.method,
        path: request.path.clone(),
        route: request.route.clone(),
        body: payload,
        call_site: Arc::clone(&request.call_site),
    }
    .into()
}

fn http_error(request: &Prepared, status: http::StatusCode, body: ResponseBody) -> HttpError {
    HttpError {
        status,
        method: request.method,
        path: request.path.clone(),
        route: request.route.clone(),
        body,
        call_site: Arc::clone(&request.call_site),
    }
}

fn missing_headers_report(
    request: &Prepared,
    status: http::StatusCode,
    headers: &HeaderMap,
    bucket: &BucketSnapshot,
) -> String {
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("none")
            .to_owned()
    };
    let content_type = get(header::CONTENT_TYPE.as_str());
    [
        format!(
            "Missing ratelimit headers for RouteBucket({}/{}) with non-default limit",
            bucket.remaining, bucket.limit
        ),
        format!(
            "{status} {content_type}: {} {} | {}",
            request.method,
            request.route,
            get("cf-ray")
        ),
        format!("content-type = {content_type}"),
        format!("{REMAINING} = {}", get(REMAINING)),
        format!("{LIMIT} = {}", get(LIMIT)),
        format!("{RESET} = {}", get(RESET)),
        format!("{GLOBAL} = {}", get(GLOBAL)),
    ]
    .join("\n")
}
