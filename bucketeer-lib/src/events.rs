//! Observability signals published by the dispatcher.
//!
//! Every signal also goes to the `log` facade. Subscribers additionally get
//! them as [`Event`]s; payloads are only built while someone listens or the
//! matching log level is enabled.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::{ErrorKind, Method, RequestBody, ResponseBody};

/// Buffered events per subscriber before the oldest are dropped
const EVENT_CAPACITY: usize = 256;

/// A signal from the dispatcher
#[derive(Debug, Clone)]
pub enum Event {
    /// Narrative of a completed or retried attempt, and protocol anomalies
    Debug(String),
    /// Something the operator should look at, like suspected clock drift
    Warn(String),
    /// A non-fatal error: unparsable bodies and transport failures
    Error(Arc<ErrorKind>),
    /// A completed request/response exchange
    Request(RawRequest),
}

/// Raw data of one completed exchange
#[derive(Debug, Clone)]
pub struct RawRequest {
    /// Method of the request
    pub method: Method,
    /// Path of the request
    pub path: String,
    /// Route key the request was counted against
    pub route: String,
    /// Whether the request carried authorization
    pub with_auth: bool,
    /// Body that was sent
    pub request_body: Option<RequestBody>,
    /// Body that came back
    pub response_body: ResponseBody,
}

#[derive(Debug, Clone)]
pub(crate) struct Events {
    sender: broadcast::Sender<Event>,
}

impl Default for Events {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }
}

impl Events {
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    fn has_listeners(&self) -> bool {
        self.sender.receiver_count() > 0
    }

    pub(crate) fn debug(&self, message: impl FnOnce() -> String) {
        let listening = self.has_listeners();
        if !listening && !log::log_enabled!(log::Level::Debug) {
            return;
        }
        let message = message();
        log::debug!("{message}");
        if listening {
            let _ = self.sender.send(Event::Debug(message));
        }
    }

    pub(crate) fn warn(&self, message: String) {
        log::warn!("{message}");
        if self.has_listeners() {
            let _ = self.sender.send(Event::Warn(message));
        }
    }

    pub(crate) fn error(&self, error: ErrorKind) {
        log::error!("{error}");
        if self.has_listeners() {
            let _ = self.sender.send(Event::Error(Arc::new(error)));
        }
    }

    pub(crate) fn request(&self, raw: impl FnOnce() -> RawRequest) {
        if self.has_listeners() {
            let _ = self.sender.send(Event::Request(raw()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_payload_only_built_with_listeners() {
        let events = Events::default();
        events.request(|| unreachable!("nobody is listening"));

        let mut receiver = events.subscribe();
        events.request(|| RawRequest {
            method: Method::Get,
            path: "/gateway".into(),
            route: "/gateway".into(),
            with_auth: false,
            request_body: None,
            response_body: ResponseBody::Empty,
        });
        assert!(matches!(
            receiver.try_recv(),
            Ok(Event::Request(RawRequest { with_auth: false, .. }))
        ));
    }

    #[test]
    fn test_signals_reach_subscribers() {
        let events = Events::default();
        let mut receiver = events.subscribe();

        events.debug(|| "narrative".to_owned());
        events.warn("drift".to_owned());
        events.error(ErrorKind::InvalidMethod("TRACE".into()));

        assert!(matches!(receiver.try_recv(), Ok(Event::Debug(m)) if m == "narrative"));
        assert!(matches!(receiver.try_recv(), Ok(Event::Warn(m)) if m == "drift"));
        assert!(matches!(
            receiver.try_recv(),
            Ok(Event::Error(e)) if matches!(*e, ErrorKind::InvalidMethod(_))
        ));
    }
}
