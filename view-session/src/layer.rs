//! Tower middleware that keeps a session bound for each dispatch of a request.
//!
//! ```ignore
//! let app = ServiceBuilder::new()
//!     .layer(OpenSessionLayer::new(registry).with_policy(policy))
//!     .service(router);
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::response::{IntoResponse, Response};
use http::Request;
use tower::{Layer, Service};
use tracing::Instrument;
use view_common::logging::generate_request_id;

use crate::dispatch::{AppliedFilters, DispatchPolicy, FilterDecision};
use crate::guard::OpenSessionInView;
use crate::registry::AppRegistry;
use crate::resources::ResourceContext;
use crate::scope::SessionScope;

/// Header carrying the request ID used in dispatch spans.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

const DEFAULT_NAME: &str = "open_session_in_view";

/// A `Layer` binding a session around every handled dispatch.
#[derive(Debug, Clone)]
pub struct OpenSessionLayer {
    guard: Arc<OpenSessionInView>,
    policy: Arc<DispatchPolicy>,
    name: Arc<str>,
}

impl OpenSessionLayer {
    /// Layer resolving its session factory lazily from `registry`.
    pub fn new(registry: Arc<AppRegistry>) -> Self {
        Self::from_guard(Arc::new(OpenSessionInView::new(registry)))
    }

    pub fn from_guard(guard: Arc<OpenSessionInView>) -> Self {
        Self {
            guard,
            policy: Arc::new(DispatchPolicy::default()),
            name: Arc::from(DEFAULT_NAME),
        }
    }

    pub fn with_policy(mut self, policy: DispatchPolicy) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Name used to recognise a dispatch this layer already handled. Layers
    /// binding different factories in the same stack need distinct names.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Arc::from(name.into());
        self
    }

    pub fn guard(&self) -> &Arc<OpenSessionInView> {
        &self.guard
    }
}

impl<S> Layer<S> for OpenSessionLayer {
    type Service = OpenSessionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        OpenSessionService {
            inner,
            guard: self.guard.clone(),
            policy: self.policy.clone(),
            name: self.name.clone(),
        }
    }
}

/// Service produced by [`OpenSessionLayer`].
#[derive(Debug, Clone)]
pub struct OpenSessionService<S> {
    inner: S,
    guard: Arc<OpenSessionInView>,
    policy: Arc<DispatchPolicy>,
    name: Arc<str>,
}

impl<S, B> Service<Request<B>> for OpenSessionService<S>
where
    S: Service<Request<B>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<B>) -> Self::Future {
        // The readied service goes into the future; keep a fresh clone here.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let dispatch = match self.policy.decide(&request, &self.name) {
            FilterDecision::Apply(dispatch) => dispatch,
            decision => {
                tracing::trace!(?decision, path = %request.uri().path(), "Session guard not applied");
                return Box::pin(inner.call(request));
            }
        };

        let request_id = request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map_or_else(generate_request_id, ToString::to_string);
        let span = view_common::dispatch_span!(
            request_id,
            dispatch = dispatch.as_str(),
            path = %request.uri().path()
        );

        let factory = match self.guard.session_factory() {
            Ok(factory) => factory.clone(),
            Err(err) => {
                tracing::error!(
                    parent: &span,
                    error = %err,
                    "Session factory could not be resolved; aborting request"
                );
                return Box::pin(async move { Ok(err.into_response()) });
            }
        };

        let context = ResourceContext::current_or_new();
        AppliedFilters::mark(&mut request, &self.name, dispatch);
        request.extensions_mut().insert(dispatch);
        request.extensions_mut().insert(context.clone());

        Box::pin(
            context
                .clone()
                .scope(async move {
                    let _scope = match SessionScope::enter(&factory, &context) {
                        Ok(scope) => scope,
                        Err(err) => {
                            tracing::error!(error = %err, "Failed to open session for request");
                            return Ok(err.into_response());
                        }
                    };
                    inner.call(request).await
                })
                .instrument(span),
        )
    }
}
