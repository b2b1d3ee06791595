//! Request logging with a per-request id.
//!
//! Every request runs inside a `request` span carrying a request id, so log
//! lines emitted by handlers and the blocking jobs they start can be
//! correlated. The id is taken from an incoming `x-request-id` header when
//! present, otherwise a UUID v4 is generated; it is echoed back in the
//! response.

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::header::{HeaderName, HeaderValue},
    Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub struct RequestLogging;

impl<S, B> Transform<S, ServiceRequest> for RequestLogging
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RequestLoggingMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestLoggingMiddleware { service }))
    }
}

pub struct RequestLoggingMiddleware<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for RequestLoggingMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let start_time = Instant::now();
        let request_id = req
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let remote_addr = req
            .connection_info()
            .realip_remote_addr()
            .unwrap_or("unknown")
            .to_string();

        let span = info_span!(
            "request",
            request_id = %request_id,
            method = %req.method(),
            uri = %req.uri(),
        );
        let fut = {
            let _entered = span.enter();
            info!(remote_addr = %remote_addr, "Request started");
            self.service.call(req)
        };

        Box::pin(
            async move {
                let mut result = fut.await;
                let duration_ms = start_time.elapsed().as_millis();

                match &mut result {
                    Ok(response) => {
                        if let Ok(value) = HeaderValue::from_str(&request_id) {
                            response
                                .headers_mut()
                                .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
                        }
                        info!(
                            status = %response.status().as_u16(),
                            duration_ms = %duration_ms,
                            "Request completed"
                        );
                    }
                    Err(err) => {
                        error!(duration_ms = %duration_ms, error = %err, "Request failed");
                    }
                }

                result
            }
            .instrument(span),
        )
    }
}
