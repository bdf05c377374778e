//! Tower middleware that puts an [`AdmissionGate`] in front of an HTTP service.
//!
//! Identity comes from request extensions: an authentication layer upstream
//! inserts [`Principal`], the server inserts [`ClientAddr`]. Without either,
//! the first `X-Forwarded-For` entry is used, then [`ANONYMOUS_PRINCIPAL`](super::ANONYMOUS_PRINCIPAL).
//!
//! Rejections become complete responses (status, `Retry-After`, JSON body);
//! the service error type is the inner service's, unchanged.

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use http::{Request, Response};
use tower_layer::Layer;
use tower_service::Service;

use super::{AdmissionGate, GateError, RateStatus, Rejection, RequestMeta};

/// Authenticated user id, set by upstream authentication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal(pub String);

/// Remote peer address, set by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientAddr(pub IpAddr);

/// Limit in force for the caller's window.
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Permits left in the window.
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// Window reset, unix seconds.
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
/// `exempt` for trusted principals.
pub const X_RATELIMIT_STATUS: HeaderName = HeaderName::from_static("x-ratelimit-status");
/// `high` while the system is under high load.
pub const X_SYSTEM_LOAD: HeaderName = HeaderName::from_static("x-system-load");
/// `true` when the limit was reduced for load.
pub const X_RATE_LIMIT_REDUCED: HeaderName = HeaderName::from_static("x-rate-limit-reduced");

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Extract what the gate needs from a request.
pub fn request_meta<B>(req: &Request<B>) -> RequestMeta {
    let principal = req
        .extensions()
        .get::<Principal>()
        .map(|p| p.0.clone())
        .filter(|p| !p.is_empty());
    let client_addr = req
        .extensions()
        .get::<ClientAddr>()
        .map(|addr| addr.0.to_string())
        .or_else(|| forwarded_for(req.headers()));

    RequestMeta { principal, client_addr, path: req.uri().path().to_string() }
}

fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    headers
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Write rate metadata headers.
pub fn apply_rate_headers(headers: &mut HeaderMap, rate: &RateStatus, high_load: bool) {
    match *rate {
        RateStatus::Limited { limit, remaining, reset_epoch_secs } => {
            headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
            headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(remaining));
            headers.insert(X_RATELIMIT_RESET, HeaderValue::from(reset_epoch_secs));
            if high_load {
                headers.insert(X_SYSTEM_LOAD, HeaderValue::from_static("high"));
                headers.insert(X_RATE_LIMIT_REDUCED, HeaderValue::from_static("true"));
            }
        }
        RateStatus::Exempt => {
            headers.insert(X_RATELIMIT_STATUS, HeaderValue::from_static("exempt"));
        }
    }
}

/// Build the client response for a rejection.
pub fn rejection_response<B: From<String>>(rejection: &Rejection) -> Response<B> {
    let error = &rejection.error;
    let mut response = Response::new(B::from(error.body().to_json()));
    *response.status_mut() = error.status_code();

    let headers = response.headers_mut();
    headers.insert(RETRY_AFTER, HeaderValue::from(error.retry_after_secs()));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(rate) = &rejection.rate {
        apply_rate_headers(headers, rate, rejection.high_load);
    }
    response
}

/// Layer that wraps services in [`AdmissionService`].
#[derive(Clone, Debug)]
pub struct AdmissionLayer {
    gate: AdmissionGate,
}

impl AdmissionLayer {
    /// Wrap services with `gate`.
    pub fn new(gate: AdmissionGate) -> Self {
        Self { gate }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionService { inner: service, gate: self.gate.clone() }
    }
}

/// Middleware service running every request through the gate.
#[derive(Clone, Debug)]
pub struct AdmissionService<S> {
    inner: S,
    gate: AdmissionGate,
}

impl<S> AdmissionService<S> {
    /// Wrap `inner` directly.
    pub fn new(inner: S, gate: AdmissionGate) -> Self {
        Self { inner, gate }
    }

    /// The gate in front of the service.
    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for AdmissionService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: From<String> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // Take the instance that was driven to ready; leave the clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let gate = self.gate.clone();

        Box::pin(async move {
            let meta = request_meta(&req);
            let admission = match gate.admit(&meta).await {
                Ok(admission) => admission,
                Err(rejection) => return Ok(rejection_response(&rejection)),
            };

            let count_server_errors = admission.count_server_errors();
            let outcome = admission
                .execute_with(
                    || inner.call(req),
                    |res: &Result<Response<ResBody>, S::Error>| match res {
                        Ok(response) => count_server_errors && response.status().is_server_error(),
                        Err(_) => true,
                    },
                )
                .await;

            match outcome {
                Ok(mut response) => {
                    apply_rate_headers(response.headers_mut(), admission.rate(), admission.high_load());
                    Ok(response)
                }
                Err(GateError::Rejected(rejection)) => Ok(rejection_response(&rejection)),
                Err(GateError::Inner(err)) => Err(err),
            }
        })
    }
}
