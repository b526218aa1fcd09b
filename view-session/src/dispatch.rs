//! Dispatch types and the policy deciding which dispatches the guard handles.
//!
//! A request can pass through the pipeline more than once: after an async
//! suspension completes, or when an error handler re-dispatches it to an
//! error page. Each pass is a dispatch. Ambient state does not carry over
//! between dispatches, so the guard re-evaluates its bindings on every one it
//! is configured to handle.

use std::collections::HashSet;
use std::sync::Arc;

use http::Request;
use serde::{Deserialize, Serialize};
use view_common::SessionConfig;

/// Kind of pass a request is making through the pipeline.
///
/// Stored in the request extensions; a request without one is a plain
/// [`DispatchType::Request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchType {
    #[default]
    Request,
    Async,
    Error,
}

impl DispatchType {
    pub fn of<B>(request: &Request<B>) -> Self {
        request.extensions().get::<Self>().copied().unwrap_or_default()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Async => "async",
            Self::Error => "error",
        }
    }
}

/// Guards that already handled a request, per dispatch.
#[derive(Debug, Clone, Default)]
pub(crate) struct AppliedFilters(HashSet<(Arc<str>, DispatchType)>);

impl AppliedFilters {
    fn contains(&self, name: &str, dispatch: DispatchType) -> bool {
        self.0.contains(&(Arc::from(name), dispatch))
    }

    pub(crate) fn mark<B>(request: &mut Request<B>, name: &Arc<str>, dispatch: DispatchType) {
        let extensions = request.extensions_mut();
        if extensions.get::<Self>().is_none() {
            extensions.insert(Self::default());
        }
        if let Some(applied) = extensions.get_mut::<Self>() {
            applied.0.insert((name.clone(), dispatch));
        }
    }
}

/// What the guard does with one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    /// Bind a session for this dispatch.
    Apply(DispatchType),
    /// The policy opts out of this dispatch type.
    SkipDispatch(DispatchType),
    /// The path is excluded.
    SkipPath,
    /// This guard already handled the same dispatch further out.
    AlreadyApplied(DispatchType),
}

/// Which dispatches and paths the session guard applies to.
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    pub filter_async_dispatch: bool,
    pub filter_error_dispatch: bool,
    pub exclude_paths: Vec<String>,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            filter_async_dispatch: true,
            filter_error_dispatch: true,
            exclude_paths: Vec::new(),
        }
    }
}

impl From<&SessionConfig> for DispatchPolicy {
    fn from(config: &SessionConfig) -> Self {
        Self {
            filter_async_dispatch: config.filter_async_dispatch,
            filter_error_dispatch: config.filter_error_dispatch,
            exclude_paths: config.exclude_paths.clone(),
        }
    }
}

impl DispatchPolicy {
    pub fn exclude_path(mut self, prefix: impl Into<String>) -> Self {
        self.exclude_paths.push(prefix.into());
        self
    }

    pub fn skips_dispatch(&self, dispatch: DispatchType) -> bool {
        match dispatch {
            DispatchType::Request => false,
            DispatchType::Async => !self.filter_async_dispatch,
            DispatchType::Error => !self.filter_error_dispatch,
        }
    }

    /// Prefix match on whole path segments: `/health` excludes `/health`
    /// and `/health/live`, not `/healthz`.
    pub fn excludes_path(&self, path: &str) -> bool {
        self.exclude_paths.iter().any(|prefix| {
            path.strip_prefix(prefix.as_str()).is_some_and(|rest| {
                rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/')
            })
        })
    }

    pub fn decide<B>(&self, request: &Request<B>, name: &str) -> FilterDecision {
        let dispatch = DispatchType::of(request);
        if self.skips_dispatch(dispatch) {
            return FilterDecision::SkipDispatch(dispatch);
        }
        if self.excludes_path(request.uri().path()) {
            return FilterDecision::SkipPath;
        }
        let already = request
            .extensions()
            .get::<AppliedFilters>()
            .is_some_and(|applied| applied.contains(name, dispatch));
        if already {
            return FilterDecision::AlreadyApplied(dispatch);
        }
        FilterDecision::Apply(dispatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn request(path: &str, dispatch: Option<DispatchType>) -> Request<()> {
        let mut req = Request::builder().uri(path).body(()).unwrap();
        if let Some(d) = dispatch {
            req.extensions_mut().insert(d);
        }
        req
    }

    #[test_case(true, true, DispatchType::Request => false ; "request always filtered")]
    #[test_case(true, true, DispatchType::Async => false ; "async filtered by default")]
    #[test_case(true, true, DispatchType::Error => false ; "error filtered by default")]
    #[test_case(false, true, DispatchType::Async => true ; "async opt out")]
    #[test_case(true, false, DispatchType::Error => true ; "error opt out")]
    #[test_case(false, false, DispatchType::Request => false ; "opt outs never skip request")]
    fn test_skips_dispatch(filter_async: bool, filter_error: bool, dispatch: DispatchType) -> bool {
        let policy = DispatchPolicy {
            filter_async_dispatch: filter_async,
            filter_error_dispatch: filter_error,
            exclude_paths: Vec::new(),
        };
        policy.skips_dispatch(dispatch)
    }

    #[test_case("/health" => true)]
    #[test_case("/health/live" => true)]
    #[test_case("/healthz" => false)]
    #[test_case("/static/app.js" => true)]
    #[test_case("/api/v1/notes" => false)]
    fn test_excludes_path(path: &str) -> bool {
        DispatchPolicy::default()
            .exclude_path("/health")
            .exclude_path("/static/")
            .excludes_path(path)
    }

    #[test]
    fn test_dispatch_type_defaults_to_request() {
        assert_eq!(DispatchType::of(&request("/", None)), DispatchType::Request);
        assert_eq!(
            DispatchType::of(&request("/", Some(DispatchType::Error))),
            DispatchType::Error
        );
    }

    #[test]
    fn test_decide_once_per_dispatch() {
        let policy = DispatchPolicy::default();
        let name: Arc<str> = Arc::from("session");
        let mut req = request("/api", None);

        assert_eq!(
            policy.decide(&req, &name),
            FilterDecision::Apply(DispatchType::Request)
        );
        AppliedFilters::mark(&mut req, &name, DispatchType::Request);
        assert_eq!(
            policy.decide(&req, &name),
            FilterDecision::AlreadyApplied(DispatchType::Request)
        );
        assert_eq!(
            policy.decide(&req, "other"),
            FilterDecision::Apply(DispatchType::Request)
        );

        req.extensions_mut().insert(DispatchType::Error);
        assert_eq!(
            policy.decide(&req, &name),
            FilterDecision::Apply(DispatchType::Error)
        );
    }

    #[test]
    fn test_decide_skips() {
        let policy = DispatchPolicy {
            filter_async_dispatch: false,
            ..DispatchPolicy::default()
        }
        .exclude_path("/health");

        assert_eq!(
            policy.decide(&request("/api", Some(DispatchType::Async)), "s"),
            FilterDecision::SkipDispatch(DispatchType::Async)
        );
        assert_eq!(
            policy.decide(&request("/health", None), "s"),
            FilterDecision::SkipPath
        );
    }

    #[test]
    fn test_policy_from_config() {
        let config = SessionConfig {
            filter_async_dispatch: false,
            filter_error_dispatch: true,
            exclude_paths: vec!["/assets".into()],
        };
        let policy = DispatchPolicy::from(&config);
        assert!(policy.skips_dispatch(DispatchType::Async));
        assert!(policy.excludes_path("/assets/logo.png"));
    }
}
