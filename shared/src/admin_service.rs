use crate::http::{ResponseBody, full_body, make_boxed_error_response, make_json_response};
use hyper::body::Incoming;
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

/// Liveness, readiness and status endpoints served on the admin listener.
///
/// - `GET /health` always answers `ok`
/// - `GET /ready` answers `ok` once `is_ready` returns true, 503 before that
/// - `GET /upstreams` answers with the JSON document produced by `status`
pub struct AdminService<F, S, E> {
    is_ready: F,
    status: S,
    _error: PhantomData<E>,
}

impl<F, S, E> AdminService<F, S, E>
where
    F: Fn() -> bool,
    S: Fn() -> serde_json::Value,
{
    pub fn new(is_ready: F, status: S) -> Self {
        Self {
            is_ready,
            status,
            _error: PhantomData,
        }
    }
}

impl<F, S, E> Service<Request<Incoming>> for AdminService<F, S, E>
where
    F: Fn() -> bool + Send + Sync + 'static,
    S: Fn() -> serde_json::Value + Send + Sync + 'static,
    E: Send + 'static,
{
    type Response = Response<ResponseBody>;
    type Error = E;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let res = if req.method() != Method::GET {
            make_boxed_error_response(StatusCode::METHOD_NOT_ALLOWED)
        } else {
            match req.uri().path() {
                "/health" => Response::new(full_body("ok\n")),
                "/ready" => match (self.is_ready)() {
                    true => Response::new(full_body("ok\n")),
                    false => make_boxed_error_response(StatusCode::SERVICE_UNAVAILABLE),
                },
                "/upstreams" => make_json_response(StatusCode::OK, &(self.status)()),
                _ => make_boxed_error_response(StatusCode::NOT_FOUND),
            }
        };

        Box::pin(async move { Ok(res) })
    }
}
