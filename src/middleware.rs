use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    web, Error, HttpMessage,
};
use futures_util::future::{ready, LocalBoxFuture, Ready};

use crate::auth::Principal;
use crate::handlers::AppState;

/// Resolves a [`Principal`] for every request and attaches it to the request
/// extensions so downstream handlers and the policy engine never touch the
/// raw token. A missing or disabled token resolves to the anonymous
/// principal rather than rejecting the request here — policies decide.
pub struct AuthenticationMiddleware;

impl<S, B> Transform<S, ServiceRequest> for AuthenticationMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = AuthenticationMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AuthenticationMiddlewareService { service }))
    }
}

pub struct AuthenticationMiddlewareService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for AuthenticationMiddlewareService<S>
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
        let state = req.app_data::<web::Data<AppState>>().cloned();

        let principal = match &state {
            Some(state) => match state.auth.authenticate(req.request()) {
                Ok(p) => p,
                Err(e) => {
                    return Box::pin(async move { Err(actix_web::Error::from(e)) });
                }
            },
            None => Principal::anonymous(),
        };

        req.extensions_mut().insert(principal);

        let fut = self.service.call(req);
        Box::pin(async move { fut.await })
    }
}

/// Extract the attached principal; every request has one by the time a
/// handler runs, so a missing extension indicates the middleware was not
/// wired into this route's pipeline.
pub fn principal_from_request(req: &actix_web::HttpRequest) -> Principal {
    req.extensions()
        .get::<Principal>()
        .cloned()
        .unwrap_or_else(Principal::anonymous)
}
