use crate::middleware::logging::is_websocket_upgrade;
use crate::state::AppState;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    web, Error,
};
use futures_util::future::LocalBoxFuture;
use std::future::{ready, Ready};

/// Counts HTTP requests and error responses into `AppMetrics`.
/// WebSocket upgrades are counted by the actor as connections instead.
pub struct RequestMetrics;

impl<S, B> Transform<S, ServiceRequest> for RequestMetrics
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RequestMetricsService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestMetricsService { service }))
    }
}

pub struct RequestMetricsService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for RequestMetricsService<S>
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
        let app_state = if is_websocket_upgrade(&req) {
            None
        } else {
            req.app_data::<web::Data<AppState>>().cloned()
        };

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;

            if let Some(app_state) = app_state {
                let is_error = match &result {
                    Ok(response) => {
                        response.status().is_client_error() || response.status().is_server_error()
                    }
                    Err(_) => true,
                };
                app_state.record_request(is_error);
            }

            result
        })
    }
}
