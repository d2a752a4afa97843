use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use tokio::time::Instant;

use crate::types::TransportError;
use crate::{Method, RequestBody, Transport, TransportRequest, TransportResponse};

type Responder =
    Box<dyn Fn(&TransportRequest) -> Result<TransportResponse, TransportError> + Send + Sync>;

/// A request as seen by [`FakeTransport`]
#[derive(Debug, Clone)]
pub(crate) struct SentRequest {
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Option<RequestBody>,
    pub(crate) started: Instant,
}

/// In-memory [`Transport`] answering from a responder function or a script
/// of canned responses, recording everything it was sent.
pub(crate) struct FakeTransport {
    responder: Responder,
    script: Mutex<VecDeque<TransportResponse>>,
    delay: Duration,
    sent: Mutex<Vec<SentRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl std::fmt::Debug for FakeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeTransport")
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

impl FakeTransport {
    /// Answer every request through `responder`
    pub(crate) fn new(
        responder: impl Fn(&TransportRequest) -> Result<TransportResponse, TransportError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            responder: Box::new(responder),
            script: Mutex::new(VecDeque::new()),
            delay: Duration::ZERO,
            sent: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Answer with `responses` in order, then with a plain 200
    pub(crate) fn scripted(responses: impl IntoIterator<Item = TransportResponse>) -> Self {
        let fake = Self::new(|_| Ok(response(200, &[], "")));
        fake.script.lock().unwrap().extend(responses);
        fake
    }

    /// Take `delay` to answer each request
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn sent(&self) -> Vec<SentRequest> {
        self.sent.lock().unwrap().clone()
    }

    /// Highest number of requests that were in flight at once
    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        self.sent.lock().unwrap().push(SentRequest {
            method: request.method,
            path: request.url.path().to_owned(),
            headers: request.headers.clone(),
            body: request.body.clone(),
            started: Instant::now(),
        });

        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
        if self.delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let scripted = self.script.lock().unwrap().pop_front();
        match scripted {
            Some(response) => Ok(response),
            None => (self.responder)(&request),
        }
    }
}

/// Build a canned response
pub(crate) fn response(status: u16, headers: &[(&str, &str)], body: &str) -> TransportResponse {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    TransportResponse {
        status: StatusCode::from_u16(status).unwrap(),
        headers: map,
        body: body.to_owned(),
    }
}
