//! Per-endpoint request counting for `/metrics`.
//!
//! Endpoints are keyed by method and route pattern, so unmatched paths are
//! grouped by their literal path.

use crate::state::AppState;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    web, Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};

pub struct MetricsMiddleware;

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = MetricsMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MetricsMiddlewareService { service }))
    }
}

pub struct MetricsMiddlewareService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for MetricsMiddlewareService<S>
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
        let state = req.app_data::<web::Data<AppState>>().cloned();
        if let Some(state) = &state {
            state.increment_request_count();
        }

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let Some(state) = state else {
                return result;
            };
            let duration_ms = start_time.elapsed().as_millis() as u64;

            match &result {
                Ok(response) => {
                    let request = response.request();
                    let route = request
                        .match_pattern()
                        .unwrap_or_else(|| request.path().to_string());
                    let endpoint = format!("{} {}", request.method(), route);
                    let status = response.status();
                    let is_error = status.is_client_error() || status.is_server_error();

                    state.record_endpoint_request(&endpoint, duration_ms, is_error);
                    if is_error {
                        state.increment_error_count();
                    }
                }
                Err(_) => state.increment_error_count(),
            }

            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::test_state;
    use actix_web::{test, App, HttpResponse};

    #[actix_web::test]
    async fn test_counts_requests_and_errors_per_route() {
        let dir = tempfile::tempdir().unwrap();
        let state = web::Data::new(test_state(dir.path()));
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .wrap(MetricsMiddleware)
                .route("/ok", web::get().to(|| async { HttpResponse::Ok().finish() }))
                .route("/fail", web::get().to(|| async { HttpResponse::BadRequest().finish() })),
        )
        .await;

        for uri in ["/ok", "/ok", "/fail"] {
            test::call_service(&app, test::TestRequest::get().uri(uri).to_request()).await;
        }

        let snapshot = state.get_metrics_snapshot();
        assert_eq!(snapshot.request_count, 3);
        assert_eq!(snapshot.error_count, 1);
        assert_eq!(snapshot.endpoint_metrics["GET /ok"].request_count, 2);
        assert_eq!(snapshot.endpoint_metrics["GET /fail"].error_count, 1);
    }
}
