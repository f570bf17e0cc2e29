//! Logic controller (`spec.md` §4.6): runs middleware, sequences the
//! existence/enablement/auth checks, calls the backend, emits lifecycle
//! events.

use std::sync::Arc;

use axum::http::{HeaderName, HeaderValue, StatusCode};
use bytes::Bytes;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::backend::Backend;
use crate::context::{Context, LifecycleStatus, ResponseBody};
use crate::error::GatewayError;
use crate::service::Service;
use crate::signals::{dispatch_complete, dispatch_usable, CompleteObserver, UsableObserver};

/// Overridable controller checks (`spec.md` §4.6, §9 "Overridable
/// controller methods"): each of `checkForAuth`/`checkIfEnabled`/
/// `checkIfExists` accepts `true` (disable — treat as passed), a
/// replacement predicate, or absence (delegate to the backend).
#[derive(Clone, Default)]
pub enum Override {
    #[default]
    Delegate,
    Disabled,
    Replace(Arc<dyn Fn(&Context) -> bool + Send + Sync>),
}

impl Override {
    /// `None` means "fall through to the backend"; `Some(b)` is the
    /// decided value.
    fn evaluate(&self, ctx: &Context) -> Option<bool> {
        match self {
            Self::Delegate => None,
            Self::Disabled => Some(true),
            Self::Replace(f) => Some(f(ctx)),
        }
    }
}

#[derive(Clone, Default)]
pub struct Overrides {
    pub check_for_auth: Override,
    pub check_if_enabled: Override,
    pub check_if_exists: Override,
}

#[derive(Clone)]
pub struct ControllerOptions {
    pub overrides: Overrides,
    /// When true, all 401/403 rejections are coerced to 404 so the
    /// existence of protected repos is not disclosed.
    pub privacy_mode: bool,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            overrides: Overrides::default(),
            privacy_mode: false,
        }
    }
}

pub struct Controller {
    backend: Backend,
    options: ControllerOptions,
    usable: Vec<Box<dyn UsableObserver>>,
    complete: Vec<Box<dyn CompleteObserver>>,
}

impl Controller {
    #[must_use]
    pub fn new(backend: Backend, options: ControllerOptions) -> Self {
        Self {
            backend,
            options,
            usable: Vec::new(),
            complete: Vec::new(),
        }
    }

    /// Registers an `onUsable` observer; dispatch order follows
    /// registration order.
    pub fn on_usable(&mut self, observer: impl UsableObserver + 'static) {
        self.usable.push(Box::new(observer));
    }

    /// Registers an `onComplete` observer.
    pub fn on_complete(&mut self, observer: impl CompleteObserver + 'static) {
        self.complete.push(Box::new(observer));
    }

    fn deny_status(&self, status: StatusCode) -> StatusCode {
        if self.options.privacy_mode
            && matches!(status, StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
        {
            StatusCode::NOT_FOUND
        } else {
            status
        }
    }

    /// `spec.md` §4.6 `serve(ctx)`.
    pub async fn serve(&self, ctx: &Context) -> Result<(), GatewayError> {
        let request_id = Uuid::new_v4();
        let span = info_span!(
            "gateway_request",
            request_id = %request_id,
            method = %ctx.method(),
            path = ctx.path().unwrap_or(""),
        );
        let result = self.serve_inner(ctx).instrument(span.clone()).await;
        let _enter = span.enter();
        match &result {
            Ok(()) if ctx.response_status().as_u16() < 500 => {
                info!(status = ctx.response_status().as_u16(), "request served");
            }
            Ok(()) => {
                error!(status = ctx.response_status().as_u16(), "request served with server error");
            }
            Err(e) => {
                error!(code = e.code(), error = ?e, "request failed");
            }
        }
        result
    }

    async fn serve_inner(&self, ctx: &Context) -> Result<(), GatewayError> {
        if !ctx.is_initialised() {
            ctx.initialise().await?;
        }
        if !pending(ctx) {
            return Ok(());
        }

        dispatch_usable(&self.usable, ctx).await?;
        if !pending(ctx) {
            return Ok(());
        }

        let (service, path) = (ctx.service(), ctx.path());
        if service.is_none() || path.is_none() {
            // §4.6 step 3: unlike the other denials below, a missing
            // service/path terminates as `Failure`, not `Rejected`.
            let status = self.deny_status(StatusCode::BAD_REQUEST);
            ctx.transition(LifecycleStatus::Failure);
            ctx.set_response_status(status);
            let text = status.canonical_reason().unwrap_or("Error").to_owned();
            ctx.set_response_body(ResponseBody::Bytes(Bytes::from(text)));
            return Ok(());
        }
        let service = service.expect("checked above");

        if !self.check_if_exists(ctx).await {
            self.reject(ctx, Some(StatusCode::NOT_FOUND), None);
            return Ok(());
        }
        if !pending(ctx) {
            return Ok(());
        }

        if !self.check_if_enabled(ctx, service).await {
            self.reject(ctx, Some(self.deny_status(StatusCode::FORBIDDEN)), None);
            return Ok(());
        }
        if !pending(ctx) {
            return Ok(());
        }

        if !self.check_for_auth(ctx).await {
            self.reject(ctx, Some(self.deny_status(StatusCode::UNAUTHORIZED)), None);
            return Ok(());
        }
        if !pending(ctx) {
            return Ok(());
        }

        self.accept(ctx).await?;
        dispatch_complete(&self.complete, ctx).await
    }

    async fn check_if_exists(&self, ctx: &Context) -> bool {
        match self.options.overrides.check_if_exists.evaluate(ctx) {
            Some(v) => v,
            None => self.backend.check_if_exists(ctx).await,
        }
    }

    async fn check_if_enabled(&self, ctx: &Context, service: Service) -> bool {
        match self.options.overrides.check_if_enabled.evaluate(ctx) {
            Some(v) => v,
            None => self.backend.check_if_enabled(ctx, service).await,
        }
    }

    async fn check_for_auth(&self, ctx: &Context) -> bool {
        match self.options.overrides.check_for_auth.evaluate(ctx) {
            Some(v) => v,
            None => true,
        }
    }

    /// `spec.md` §4.6 `accept(ctx)`.
    pub async fn accept(&self, ctx: &Context) -> Result<(), GatewayError> {
        ctx.transition(LifecycleStatus::Accepted);

        if let Err(e) = self.backend.serve(ctx).await {
            ctx.transition(LifecycleStatus::Failure);
            let status = e.status_code().unwrap_or(500);
            ctx.set_response_status(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR));
            return Err(e);
        }

        let status = ctx.response_status();
        if status.as_u16() >= 400 {
            ctx.transition(LifecycleStatus::Failure);
            let text = status.canonical_reason().unwrap_or("Error").to_owned();
            ctx.set_response_body(ResponseBody::Bytes(Bytes::from(text)));
            return Ok(());
        }

        if status.as_u16() < 300 && !ctx.has_response_body() {
            return Err(GatewayError::InvalidBodyFor2xx { status: status.as_u16() });
        }

        Ok(())
    }

    /// `spec.md` §4.6 `reject(ctx, code?, reason?)`.
    pub fn reject(&self, ctx: &Context, code: Option<StatusCode>, reason: Option<&str>) {
        ctx.transition(LifecycleStatus::Rejected);
        let code = code.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let code = clamp_to_error_range(code);
        ctx.set_response_status(code);
        if !ctx.has_response_body() || reason.is_some() {
            let text = reason
                .map(str::to_owned)
                .unwrap_or_else(|| code.canonical_reason().unwrap_or("Error").to_owned());
            ctx.set_response_body(ResponseBody::Bytes(Bytes::from(text)));
        }
    }

    /// `spec.md` §6 "Controller surface exposed to embedders" `setCustom`:
    /// an escape hatch for responses that don't fit `accept`/`reject`/
    /// `redirect` — the embedder picks the status and body directly.
    pub fn set_custom(&self, ctx: &Context, status: StatusCode, body: ResponseBody) {
        ctx.transition(LifecycleStatus::Custom);
        ctx.set_response_status(status);
        ctx.set_response_body(body);
    }

    /// `spec.md` §4.6 `redirect(ctx, location?, code?)`.
    pub fn redirect(&self, ctx: &Context, location: Option<&str>, code: Option<StatusCode>) -> Result<(), GatewayError> {
        ctx.transition(LifecycleStatus::Redirect);

        if code == Some(StatusCode::NOT_MODIFIED) {
            ctx.set_response_status(StatusCode::NOT_MODIFIED);
            return Ok(());
        }

        let Some(location) = location else {
            ctx.set_response_status(StatusCode::INTERNAL_SERVER_ERROR);
            return Err(GatewayError::BackendFailure {
                inner: anyhow::anyhow!("redirect requires a location unless code is 304"),
            });
        };

        let location = if location.starts_with('/') {
            location.to_owned()
        } else {
            format!("/{location}")
        };

        ctx.insert_response_header(
            HeaderName::from_static("location"),
            HeaderValue::from_str(&location).map_err(|_| GatewayError::BackendFailure {
                inner: anyhow::anyhow!("invalid redirect location"),
            })?,
        );
        let code = code.unwrap_or(StatusCode::PERMANENT_REDIRECT);
        let code = if (300..400).contains(&code.as_u16()) {
            code
        } else {
            StatusCode::PERMANENT_REDIRECT
        };
        ctx.set_response_status(code);
        Ok(())
    }
}

fn pending(ctx: &Context) -> bool {
    matches!(ctx.status(), LifecycleStatus::Pending)
}

fn clamp_to_error_range(code: StatusCode) -> StatusCode {
    if (400..600).contains(&code.as_u16()) {
        code
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}
