//! `Context` (`spec.md` §3, §4.4): the central per-request object.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::http::header::CONTENT_TYPE;
use axum::http::{Extensions, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use subtle::ConstantTimeEq;
use tokio::sync::Mutex as AsyncMutex;

use crate::classify::{self, Classification};
use crate::error::GatewayError;
use crate::parser::{self, Capabilities, Command, ParsedState, SharedParsedState};
use crate::pktline::stream::PktLineInspectStream;
use crate::service::Service;

/// An inbound or outbound byte stream. Boxed because the concrete producer
/// (hyper body, child process stdout, `reqwest` response body, ...) varies
/// by call site.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Fixed service-header pkt-lines prepended to advertisement responses
/// (`spec.md` §4.4).
pub const UPLOAD_PACK_HEADER: &[u8] = b"001e# service=git-upload-pack\n0000";
pub const RECEIVE_PACK_HEADER: &[u8] = b"001f# service=git-receive-pack\n0000";

#[must_use]
pub fn service_header(service: Service) -> &'static [u8] {
    match service {
        Service::UploadPack => UPLOAD_PACK_HEADER,
        Service::ReceivePack => RECEIVE_PACK_HEADER,
    }
}

/// `Lifecycle status` (`spec.md` §3). Transitions out of `Pending` are
/// one-way, except `Accepted -> Failure` (a backend emitting a 4xx/5xx
/// after being accepted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStatus {
    Pending,
    Accepted,
    Rejected,
    Failure,
    Redirect,
    Custom,
}

impl LifecycleStatus {
    #[must_use]
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// A queued out-of-band message (`addMessage`/`addError`).
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub is_error: bool,
    pub text: String,
}

/// The response body materialised by [`Context::to_response_stream`] or
/// set directly by a backend.
pub enum ResponseBody {
    Bytes(Bytes),
    Stream(ByteStream),
}

impl ResponseBody {
    #[must_use]
    pub fn empty() -> Self {
        Self::Bytes(Bytes::new())
    }

    #[must_use]
    pub fn into_stream(self) -> ByteStream {
        match self {
            Self::Bytes(b) => Box::pin(futures_util::stream::once(async move { Ok(b) })),
            Self::Stream(s) => s,
        }
    }
}

struct ResponseState {
    status: StatusCode,
    headers: HeaderMap,
    body: Option<ResponseBody>,
    messages: Vec<QueuedMessage>,
    materialised: bool,
}

impl Default for ResponseState {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: None,
            messages: Vec::new(),
            materialised: false,
        }
    }
}

/// Constructor arguments for [`Context::new`]. Any of `advertisement`,
/// `path`, `service` left `None` are inferred via [`classify::classify`]
/// (`spec.md` §4.4 "Missing advertisement/path/service are inferred").
pub struct ContextRequest {
    pub method: Method,
    pub url: Uri,
    pub headers: HeaderMap,
    pub body: ByteStream,
    pub advertisement: Option<bool>,
    pub path: Option<String>,
    pub service: Option<Service>,
}

pub struct Context {
    method: Method,
    url: Uri,
    headers: HeaderMap,
    advertisement: bool,
    path: Option<String>,
    service: Option<Service>,

    body: AsyncMutex<Option<ByteStream>>,
    parsed: SharedParsedState,
    initialised: AtomicBool,
    init_lock: AsyncMutex<()>,

    status: Mutex<LifecycleStatus>,
    response: Mutex<ResponseState>,
    state: Mutex<Extensions>,
}

impl Context {
    #[must_use]
    pub fn new(req: ContextRequest) -> Self {
        let content_type = req
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let Classification {
            advertisement: inferred_adv,
            path: inferred_path,
            service: inferred_service,
        } = classify::classify(&req.url, &req.method, content_type.as_deref());

        let advertisement = req.advertisement.unwrap_or(inferred_adv);
        let path = req.path.or(inferred_path);
        let service = req.service.or(inferred_service);

        let parsed: SharedParsedState = Arc::new(Mutex::new(ParsedState::default()));

        let body: ByteStream = if !advertisement && service.is_some() {
            let sink = parser::sink_for(service.unwrap(), parsed.clone());
            let (stream, _init_rx) = PktLineInspectStream::new(req.body, sink);
            Box::pin(stream)
        } else {
            req.body
        };

        Self {
            method: req.method,
            url: req.url,
            headers: req.headers,
            advertisement,
            path,
            service,
            body: AsyncMutex::new(Some(body)),
            parsed,
            initialised: AtomicBool::new(false),
            init_lock: AsyncMutex::new(()),
            status: Mutex::new(LifecycleStatus::Pending),
            response: Mutex::new(ResponseState::default()),
            state: Mutex::new(Extensions::new()),
        }
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[must_use]
    pub fn url(&self) -> &Uri {
        &self.url
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[must_use]
    pub fn advertisement(&self) -> bool {
        self.advertisement
    }

    #[must_use]
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    #[must_use]
    pub fn service(&self) -> Option<Service> {
        self.service
    }

    #[must_use]
    pub fn is_initialised(&self) -> bool {
        self.initialised.load(Ordering::Acquire)
    }

    /// Awaits parsing of the request body's preamble. A no-op once already
    /// initialised, and for advertisement requests or requests with no
    /// known service (`spec.md` invariant: `advertisement ⇒ commands == ∅
    /// ∧ capabilities == ∅`).
    pub async fn initialise(&self) -> Result<(), GatewayError> {
        if self.initialised.load(Ordering::Acquire) {
            return Ok(());
        }

        let _serialise = self.init_lock.lock().await;
        if self.initialised.load(Ordering::Acquire) {
            return Ok(());
        }

        if self.advertisement || self.service.is_none() {
            self.initialised.store(true, Ordering::Release);
            return Ok(());
        }

        let mut guard = self.body.lock().await;
        let Some(mut stream) = guard.take() else {
            self.initialised.store(true, Ordering::Release);
            return Ok(());
        };

        let first = stream.next().await;
        *guard = Some(stream);
        drop(guard);

        match first {
            Some(Err(e)) => Err(io_error_to_gateway(e)),
            _ => {
                self.initialised.store(true, Ordering::Release);
                Ok(())
            }
        }
    }

    /// Defensive copy of the parsed commands. Awaits [`Self::initialise`].
    pub async fn commands(&self) -> Result<Vec<Command>, GatewayError> {
        self.initialise().await?;
        Ok(self.parsed.lock().expect("parsed state mutex poisoned").commands.clone())
    }

    /// Defensive copy of the parsed capabilities. Awaits
    /// [`Self::initialise`].
    pub async fn capabilities(&self) -> Result<Capabilities, GatewayError> {
        self.initialise().await?;
        Ok(self
            .parsed
            .lock()
            .expect("parsed state mutex poisoned")
            .capabilities
            .clone())
    }

    /// Takes ownership of the (possibly already-initialised) request body
    /// stream, for a backend to pipe into a subprocess or an upstream
    /// request. Can only succeed once.
    pub async fn take_body(&self) -> Option<ByteStream> {
        self.body.lock().await.take()
    }

    #[must_use]
    pub fn status(&self) -> LifecycleStatus {
        *self.status.lock().expect("status mutex poisoned")
    }

    /// Transitions lifecycle status. Only `Pending -> *` and `Accepted ->
    /// Failure` are valid (`spec.md` §3 invariant); anything else is a bug
    /// in the controller, not client input, so it's a debug assertion.
    pub fn transition(&self, new: LifecycleStatus) {
        let mut cur = self.status.lock().expect("status mutex poisoned");
        let valid = cur.is_pending() || (*cur == LifecycleStatus::Accepted && new == LifecycleStatus::Failure);
        debug_assert!(valid, "invalid status transition {cur:?} -> {new:?}");
        *cur = new;
    }

    #[must_use]
    pub fn response_status(&self) -> StatusCode {
        self.response.lock().expect("response mutex poisoned").status
    }

    pub fn set_response_status(&self, status: StatusCode) {
        self.response.lock().expect("response mutex poisoned").status = status;
    }

    pub fn insert_response_header(&self, name: axum::http::HeaderName, value: HeaderValue) {
        self.response
            .lock()
            .expect("response mutex poisoned")
            .headers
            .insert(name, value);
    }

    #[must_use]
    pub fn response_header(&self, name: &axum::http::HeaderName) -> Option<HeaderValue> {
        self.response
            .lock()
            .expect("response mutex poisoned")
            .headers
            .get(name)
            .cloned()
    }

    pub fn remove_response_header(&self, name: &axum::http::HeaderName) {
        self.response
            .lock()
            .expect("response mutex poisoned")
            .headers
            .remove(name);
    }

    #[must_use]
    pub fn has_response_body(&self) -> bool {
        self.response.lock().expect("response mutex poisoned").body.is_some()
    }

    pub fn set_response_body(&self, body: ResponseBody) {
        let mut resp = self.response.lock().expect("response mutex poisoned");
        resp.body = Some(body);
        resp.materialised = false;
    }

    pub fn add_message(&self, text: impl Into<String>) {
        self.response
            .lock()
            .expect("response mutex poisoned")
            .messages
            .push(QueuedMessage {
                is_error: false,
                text: text.into(),
            });
    }

    pub fn add_error(&self, text: impl Into<String>) {
        self.response
            .lock()
            .expect("response mutex poisoned")
            .messages
            .push(QueuedMessage {
                is_error: true,
                text: text.into(),
            });
    }

    /// Per-request scratch space for middleware (`spec.md` §4.4
    /// "Application slot"), backed by [`axum::http::Extensions`] the way
    /// the teacher threads typed values through `axum::Extension`.
    pub fn set_state<T: Clone + Send + Sync + 'static>(&self, value: T) {
        self.state.lock().expect("state mutex poisoned").insert(value);
    }

    #[must_use]
    pub fn state<T: Send + Sync + Clone + 'static>(&self) -> Option<T> {
        self.state.lock().expect("state mutex poisoned").get::<T>().cloned()
    }

    /// Materialises the response body, applying the splicing rules of
    /// `spec.md` §4.4 exactly once; subsequent calls return the cached
    /// result rather than re-running the splice (so queued messages are
    /// never duplicated). Streamed bodies can only be polled once by
    /// nature — the cache applies fully to byte-buffered bodies, and for
    /// streamed bodies the first caller is the sole consumer.
    pub async fn to_response_stream(&self) -> Result<ResponseBody, GatewayError> {
        let (content_type, body, messages, had_content_length) = {
            let mut resp = self.response.lock().expect("response mutex poisoned");
            if resp.materialised {
                if let Some(ResponseBody::Bytes(b)) = &resp.body {
                    return Ok(ResponseBody::Bytes(b.clone()));
                }
                return Ok(ResponseBody::empty());
            }
            resp.materialised = true;
            let ct = resp
                .headers
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            let had_len = resp.headers.get(axum::http::header::CONTENT_LENGTH).is_some();
            (ct, resp.body.take(), std::mem::take(&mut resp.messages), had_len)
        };

        let Some(body) = body else {
            return Ok(ResponseBody::empty());
        };

        let git_result_ct = self.service.map(|s| {
            format!(
                "application/x-git-{s}-{}",
                if self.advertisement { "advertisement" } else { "result" }
            )
        });

        if let Some(expected) = &git_result_ct {
            if content_type.as_deref() == Some(expected.as_str()) {
                if self.advertisement {
                    let header = service_header(self.service.expect("git_result_ct implies service"));
                    let (already_prefixed, body) = starts_with(body, header).await;
                    if already_prefixed {
                        return Ok(body);
                    }
                    let mut prefix = BytesMut::with_capacity(header.len());
                    prefix.extend_from_slice(header);
                    return Ok(prepend(prefix, body));
                }

                if messages.is_empty() {
                    return Ok(body);
                }
                let mut prefix = BytesMut::new();
                for m in &messages {
                    let kind = if m.is_error {
                        crate::pktline::PacketType::Error
                    } else {
                        crate::pktline::PacketType::Progress
                    };
                    prefix.extend_from_slice(&crate::pktline::encode_packet(kind, m.text.as_bytes()));
                }
                let result = prepend(prefix.clone(), body);
                if had_content_length {
                    self.adjust_content_length(prefix.len() as i64);
                }
                return Ok(result);
            }
        }

        if content_type.as_deref().is_some_and(|ct| ct.starts_with("text/plain")) {
            if messages.is_empty() {
                return Ok(body);
            }
            let mut prefix = BytesMut::new();
            for m in &messages {
                let label = if m.is_error { "Error" } else { "Message" };
                prefix.extend_from_slice(format!("{label}: {}\n", m.text).as_bytes());
            }
            let result = prepend(prefix.clone(), body);
            if had_content_length {
                self.adjust_content_length(prefix.len() as i64);
            }
            return Ok(result);
        }

        Ok(body)
    }

    fn adjust_content_length(&self, delta: i64) {
        let mut resp = self.response.lock().expect("response mutex poisoned");
        if let Some(existing) = resp.headers.get(axum::http::header::CONTENT_LENGTH) {
            if let Ok(text) = existing.to_str() {
                if let Ok(current) = text.parse::<i64>() {
                    let updated = (current + delta).max(0);
                    if let Ok(value) = HeaderValue::from_str(&updated.to_string()) {
                        resp.headers.insert(axum::http::header::CONTENT_LENGTH, value);
                    }
                }
            }
        }
    }
}

fn prepend(mut prefix: BytesMut, body: ResponseBody) -> ResponseBody {
    match body {
        ResponseBody::Bytes(b) => {
            prefix.extend_from_slice(&b);
            ResponseBody::Bytes(prefix.freeze())
        }
        ResponseBody::Stream(s) => {
            let head = futures_util::stream::once(async move { Ok(prefix.freeze()) });
            ResponseBody::Stream(Box::pin(head.chain(s)))
        }
    }
}

/// Checks whether `body` already starts with `header`, using a
/// constant-time comparison over the shared prefix (`spec.md` §4.4
/// "Constant-time prefix compare"), returning the body reconstructed so
/// the peeked bytes aren't lost.
async fn starts_with(body: ResponseBody, header: &'static [u8]) -> (bool, ResponseBody) {
    match body {
        ResponseBody::Bytes(b) => {
            let matches = ct_prefix_eq(&b, header);
            (matches, ResponseBody::Bytes(b))
        }
        ResponseBody::Stream(mut s) => {
            let mut buf = BytesMut::new();
            while buf.len() < header.len() {
                match s.next().await {
                    Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        let err_once = futures_util::stream::once(async move { Err(e) });
                        return (false, ResponseBody::Stream(Box::pin(err_once.chain(s))));
                    }
                    None => break,
                }
            }
            let matches = ct_prefix_eq(&buf, header);
            let rebuilt = futures_util::stream::once(async move { Ok(buf.freeze()) });
            (matches, ResponseBody::Stream(Box::pin(rebuilt.chain(s))))
        }
    }
}

fn ct_prefix_eq(data: &[u8], header: &[u8]) -> bool {
    if data.len() < header.len() {
        return false;
    }
    bool::from(data[..header.len()].ct_eq(header))
}

fn io_error_to_gateway(e: std::io::Error) -> GatewayError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        return GatewayError::IncompletePacket;
    }
    if let Some(boxed) = e.into_inner() {
        if let Ok(gw) = boxed.downcast::<GatewayError>() {
            return *gw;
        }
    }
    GatewayError::InvalidPacket {
        reason: "request body stream error".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, Method};
    use bytes::Bytes;

    fn body_from(chunks: Vec<&'static [u8]>) -> ByteStream {
        Box::pin(tokio_stream::iter(
            chunks.into_iter().map(|c| Ok(Bytes::from_static(c))),
        ))
    }

    #[tokio::test]
    async fn advertisement_context_has_no_commands() {
        let ctx = Context::new(ContextRequest {
            method: Method::GET,
            url: "/foo.git/info/refs?service=git-upload-pack".parse().unwrap(),
            headers: HeaderMap::new(),
            body: body_from(vec![]),
            advertisement: None,
            path: None,
            service: None,
        });

        assert!(ctx.advertisement());
        assert_eq!(ctx.commands().await.unwrap(), vec![]);
        assert!(ctx.capabilities().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn receive_pack_context_parses_commands_before_consumption() {
        let zero = "0".repeat(40);
        let new = "1".repeat(40);
        let frame = format!("{zero} {new} refs/heads/main\0report-status\n");
        let pkt = format!("{:04x}{frame}", frame.len() + 4);

        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-git-receive-pack-request"),
        );

        let ctx = Context::new(ContextRequest {
            method: Method::POST,
            url: "/r.git/git-receive-pack".parse().unwrap(),
            headers,
            body: body_from(vec![
                Box::leak(pkt.into_boxed_str()).as_bytes(),
                b"0000",
                b"PACKDATA",
            ]),
            advertisement: None,
            path: None,
            service: None,
        });

        let commands = ctx.commands().await.unwrap();
        assert_eq!(commands.len(), 1);
        let caps = ctx.capabilities().await.unwrap();
        assert!(caps.contains("report-status"));

        let mut rest = ctx.take_body().await.unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = rest.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"PACKDATA");
    }

    #[tokio::test]
    async fn status_transition_accepted_to_failure_allowed() {
        let ctx = Context::new(ContextRequest {
            method: Method::GET,
            url: "/x".parse().unwrap(),
            headers: HeaderMap::new(),
            body: body_from(vec![]),
            advertisement: Some(true),
            path: Some("x".into()),
            service: None,
        });
        ctx.transition(LifecycleStatus::Accepted);
        ctx.transition(LifecycleStatus::Failure);
        assert_eq!(ctx.status(), LifecycleStatus::Failure);
    }

    #[tokio::test]
    async fn response_materialisation_is_cached() {
        let ctx = Context::new(ContextRequest {
            method: Method::GET,
            url: "/x".parse().unwrap(),
            headers: HeaderMap::new(),
            body: body_from(vec![]),
            advertisement: Some(true),
            path: Some("x".into()),
            service: None,
        });
        ctx.set_response_body(ResponseBody::Bytes(Bytes::from_static(b"hello")));
        let first = ctx.to_response_stream().await.unwrap();
        let second = ctx.to_response_stream().await.unwrap();
        let ResponseBody::Bytes(a) = first else { panic!() };
        let ResponseBody::Bytes(b) = second else { panic!() };
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn advertisement_response_gets_header_spliced_once() {
        let ctx = Context::new(ContextRequest {
            method: Method::GET,
            url: "/foo.git/info/refs?service=git-upload-pack".parse().unwrap(),
            headers: HeaderMap::new(),
            body: body_from(vec![]),
            advertisement: None,
            path: None,
            service: None,
        });
        ctx.insert_response_header(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-git-upload-pack-advertisement"),
        );
        ctx.set_response_body(ResponseBody::Bytes(Bytes::from_static(b"0000")));

        let ResponseBody::Bytes(b) = ctx.to_response_stream().await.unwrap() else {
            panic!()
        };
        assert!(b.starts_with(UPLOAD_PACK_HEADER));
    }
}
