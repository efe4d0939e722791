use crate::{
    data::models::{Pool, Site},
    errors::ServiceError,
    operators::site_operator::get_site_by_api_key_hash_query,
    utils::hash::hash_api_key,
};
use actix_web::{
    dev::{Payload, Service, ServiceRequest, ServiceResponse, Transform},
    web, FromRequest, HttpMessage, HttpRequest,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    rc::Rc,
};

pub const API_KEY_HEADER: &str = "X-API-KEY";

/// The site resolved from the widget's API key, available to handlers behind
/// the middleware as an extractor.
#[derive(Clone, Debug)]
pub struct AuthedSite(pub Site);

impl FromRequest for AuthedSite {
    type Error = ServiceError;
    type Future = Ready<Result<Self, Self::Error>>;

    #[inline]
    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let ext = req.extensions();

        match ext.get::<AuthedSite>() {
            Some(site) => ready(Ok(site.clone())),
            None => ready(Err(ServiceError::Unauthorized)),
        }
    }
}

pub struct ApiKeyMiddlewareFactory;

impl<S, B> Transform<S, ServiceRequest> for ApiKeyMiddlewareFactory
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = actix_web::Error;
    type InitError = ();
    type Transform = ApiKeyMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(ApiKeyMiddleware {
            service: Rc::new(service),
        }))
    }
}

pub struct ApiKeyMiddleware<S> {
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for ApiKeyMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, actix_web::Error>>;

    fn poll_ready(
        &self,
        ctx: &mut core::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.service.poll_ready(ctx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);

        Box::pin(async move {
            let api_key = req
                .headers()
                .get(API_KEY_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.to_string());

            if let Some(api_key) = api_key {
                let pool = req
                    .app_data::<web::Data<Pool>>()
                    .expect("Pool is registered on the app")
                    .clone();

                if let Ok(site) =
                    get_site_by_api_key_hash_query(hash_api_key(&api_key), pool).await
                {
                    req.extensions_mut().insert(AuthedSite(site));
                }
            }

            service.call(req).await
        })
    }
}
