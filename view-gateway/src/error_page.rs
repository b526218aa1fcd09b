//! Error page re-dispatch.
//!
//! When a handler answers with a client or server error, the request is
//! dispatched a second time to the error page under [`DispatchType::Error`],
//! carrying [`ErrorAttributes`]. The session guard sits inside this layer, so
//! the error page gets a session of its own.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::response::Response;
use http::{Method, Request, StatusCode, Uri};
use tower::{Layer, Service, ServiceExt};
use view_session::{DispatchType, REQUEST_ID_HEADER};

/// What the error page knows about the failed request.
#[derive(Debug, Clone)]
pub struct ErrorAttributes {
    pub status: StatusCode,
    pub path: String,
    pub method: Method,
}

/// A `Layer` re-dispatching error responses to an error page.
#[derive(Debug, Clone)]
pub struct ErrorPageLayer {
    error_uri: Uri,
}

impl ErrorPageLayer {
    pub fn new(error_path: &'static str) -> Self {
        Self {
            error_uri: Uri::from_static(error_path),
        }
    }
}

impl<S> Layer<S> for ErrorPageLayer {
    type Service = ErrorPageService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ErrorPageService {
            inner,
            error_uri: self.error_uri.clone(),
        }
    }
}

/// Service produced by [`ErrorPageLayer`].
#[derive(Debug, Clone)]
pub struct ErrorPageService<S> {
    inner: S,
    error_uri: Uri,
}

fn should_redispatch(dispatch: DispatchType, status: StatusCode, path: &str, error_path: &str) -> bool {
    dispatch == DispatchType::Request
        && (status.is_client_error() || status.is_server_error())
        && path != error_path
}

impl<S> Service<Request<Body>> for ErrorPageService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let redispatch = self.inner.clone();
        let error_uri = self.error_uri.clone();

        let dispatch = DispatchType::of(&request);
        let path = request.uri().path().to_string();
        let method = request.method().clone();
        let request_id = request.headers().get(REQUEST_ID_HEADER).cloned();

        Box::pin(async move {
            let response = inner.call(request).await?;
            let status = response.status();
            if !should_redispatch(dispatch, status, &path, error_uri.path()) {
                return Ok(response);
            }

            tracing::debug!(status = %status, path = %path, "Re-dispatching to error page");

            let mut error_request = Request::new(Body::empty());
            *error_request.uri_mut() = error_uri;
            if let Some(id) = request_id {
                error_request.headers_mut().insert(REQUEST_ID_HEADER, id);
            }
            error_request.extensions_mut().insert(DispatchType::Error);
            error_request.extensions_mut().insert(ErrorAttributes {
                status,
                path,
                method,
            });

            let mut error_response = redispatch.oneshot(error_request).await?;
            *error_response.status_mut() = status;
            Ok(error_response)
        })
    }
}
