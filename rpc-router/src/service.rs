use crate::errors::RouterError;
use crate::jsonrpc::{
    INTERNAL_ERROR, INVALID_REQUEST, JsonRpcRequest, METHOD_NOT_FOUND, error_response,
};
use crate::metrics_defs::{REQUESTS_INFLIGHT, ROUTE_REQUESTS};
use crate::orchestrator::Orchestrator;
use crate::project::Projects;
use crate::trace::RouteTrace;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Limited};
use hyper::body::Incoming;
use hyper::service::Service;
use serde_json::{Value, json};
use shared::http::{ResponseBody, make_boxed_error_response, make_json_response};
use shared::{counter, gauge};
use std::pin::Pin;
use std::sync::Arc;
use tokio::task::JoinSet;

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
const DEBUG_HEADER: &str = "x-debug-trace";

/// Serves `POST /{project}` with a single JSON-RPC call or a batch.
pub struct RpcService {
    projects: Arc<Projects>,
}

impl RpcService {
    pub fn new(projects: Arc<Projects>) -> Self {
        Self { projects }
    }
}

impl Service<Request<Incoming>> for RpcService {
    type Response = Response<ResponseBody>;
    type Error = RouterError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let projects = self.projects.clone();
        Box::pin(async move { Ok(handle(projects, req).await) })
    }
}

async fn handle<B>(projects: Arc<Projects>, req: Request<B>) -> Response<ResponseBody>
where
    B: hyper::body::Body + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let _inflight = InflightGuard::new();
    handle_inner(projects, req).await
}

/// Counts a request as in flight until dropped, including when the client goes away
/// and the handler future is dropped mid-request.
struct InflightGuard;

impl InflightGuard {
    fn new() -> Self {
        gauge!(REQUESTS_INFLIGHT).increment(1.0);
        Self
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        gauge!(REQUESTS_INFLIGHT).decrement(1.0);
    }
}

async fn handle_inner<B>(projects: Arc<Projects>, req: Request<B>) -> Response<ResponseBody>
where
    B: hyper::body::Body + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    if req.method() != Method::POST {
        return make_boxed_error_response(StatusCode::METHOD_NOT_ALLOWED);
    }

    let project_id = req.uri().path().trim_matches('/');
    let Some(orchestrator) = projects.get(project_id) else {
        tracing::debug!(project = %project_id, "unknown project");
        return make_json_response(
            StatusCode::NOT_FOUND,
            &error_response(
                Value::Null,
                METHOD_NOT_FOUND,
                &format!("unknown project {project_id}"),
            ),
        );
    };

    let debug = wants_debug_trace(&req);

    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::debug!(error = %e, "failed to read request body");
            return invalid_request(Value::Null, "failed to read request body");
        }
    };

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => return invalid_request(Value::Null, &format!("parse error: {e}")),
    };

    match payload {
        Value::Array(items) if items.is_empty() => invalid_request(Value::Null, "empty batch"),
        Value::Array(items) => {
            let responses = route_batch(orchestrator, items, debug).await;
            make_json_response(StatusCode::OK, &responses)
        }
        item => {
            let (status, response) = route_item(&orchestrator, item, debug).await;
            make_json_response(status, &response)
        }
    }
}

fn wants_debug_trace<B>(req: &Request<B>) -> bool {
    let header = req
        .headers()
        .get(DEBUG_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));

    let query = req
        .uri()
        .query()
        .is_some_and(|q| q.split('&').any(|pair| pair == "debug=true"));

    header || query
}

fn invalid_request(id: Value, message: &str) -> Response<ResponseBody> {
    make_json_response(
        StatusCode::BAD_REQUEST,
        &error_response(id, INVALID_REQUEST, message),
    )
}

/// Routes every call of a batch concurrently and answers in request order.
async fn route_batch(
    orchestrator: Arc<Orchestrator>,
    items: Vec<Value>,
    debug: bool,
) -> Vec<Value> {
    let mut join_set = JoinSet::new();
    let count = items.len();

    for (index, item) in items.into_iter().enumerate() {
        let orchestrator = orchestrator.clone();
        join_set.spawn(async move {
            let (_, response) = route_item(&orchestrator, item, debug).await;
            (index, response)
        });
    }

    let mut responses = vec![Value::Null; count];
    while let Some(result) = join_set.join_next().await {
        match result {
            Ok((index, response)) => responses[index] = response,
            Err(e) => tracing::error!(error = %e, "batch item task failed"),
        }
    }

    // Any slot still empty belongs to a task that panicked
    for response in responses.iter_mut().filter(|r| r.is_null()) {
        *response = error_response(Value::Null, INTERNAL_ERROR, "internal error");
    }
    responses
}

/// Routes one call. Returns the HTTP status to use when the call is not part of a batch.
async fn route_item(orchestrator: &Orchestrator, item: Value, debug: bool) -> (StatusCode, Value) {
    let request = match JsonRpcRequest::from_value(item) {
        Ok(request) => request,
        Err((id, message)) => {
            counter!(
                ROUTE_REQUESTS,
                "project" => orchestrator.project().to_string(),
                "outcome" => "invalid"
            )
            .increment(1);
            return (
                StatusCode::BAD_REQUEST,
                error_response(id, INVALID_REQUEST, &message),
            );
        }
    };

    let mut trace = RouteTrace::new(debug);
    let outcome = orchestrator.route(&request, &mut trace).await;

    let (status, mut response, outcome_tag) = match outcome.result {
        Ok(payload) => (StatusCode::OK, payload, "ok"),
        Err(error) => (
            error.status(),
            error_response(request.id.clone(), error.code(), &error.to_string()),
            error.kind(),
        ),
    };
    counter!(
        ROUTE_REQUESTS,
        "project" => orchestrator.project().to_string(),
        "outcome" => outcome_tag
    )
    .increment(1);

    if trace.is_enabled()
        && let Some(object) = response.as_object_mut()
    {
        object.insert("upstream".to_string(), json!(outcome.upstream));
        object.insert("trace".to_string(), json!(trace.entries()));
    }

    (status, response)
}
