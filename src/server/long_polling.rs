//! `POST /api/data/long_polling`
//!
//! The request body is `{type: {application: [cluster, ...]}}`. Everything
//! that can fail (body validation, headers, holder initialization) fails
//! before the first byte of the response is written; afterwards the
//! response is an NDJSON stream that ends with the watch session.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use warp::http::header::HeaderValue;
use warp::http::header::CONTENT_TYPE;
use warp::http::StatusCode;
use warp::hyper::Body;
use warp::reply::Response;
use warp::Filter;
use warp::Rejection;
use warp::Reply;

use super::encode_ndjson;
use super::with_keepalive;
use crate::constants::HEADER_APPLICATION_NAME;
use crate::constants::HEADER_CLUSTER_NAME;
use crate::constants::HEADER_ROUTE_MODE;
use crate::route::RouteContext;
use crate::route::RouteHijack;
use crate::route::RouteMode;
use crate::tree::validate_name;
use crate::tree::SubscriptionRequest;
use crate::tree::TreeWatcher;
use crate::tree::WatchContext;
use crate::tree::WatcherOptions;
use crate::Error;
use crate::Result;
use crate::WatchError;

const MAX_BODY_BYTES: u64 = 1024 * 1024;
const NDJSON: &str = "application/x-ndjson";

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct LongPollQuery {
    /// Send the initial `all` dump; defaults to true
    pub trigger: Option<bool>,
    /// Requested session life span in seconds; 0 means the server maximum
    pub life_span: Option<u64>,
}

/// Caller headers, all optional
#[derive(Debug, Clone, Default)]
pub struct LongPollHeaders {
    pub route_mode: Option<String>,
    pub cluster: Option<String>,
    pub application: Option<String>,
}

impl LongPollHeaders {
    fn route_mode(&self) -> std::result::Result<RouteMode, WatchError> {
        self.route_mode.as_deref().unwrap_or_default().parse()
    }

    /// Caller identity; both headers are needed to route by caller
    fn source(&self) -> std::result::Result<Option<RouteContext>, WatchError> {
        match (&self.application, &self.cluster) {
            (Some(application), Some(cluster)) if !application.is_empty() && !cluster.is_empty() => {
                validate_name("application", application)?;
                validate_name("cluster", cluster)?;
                Ok(Some(RouteContext::new(application.as_str(), cluster.as_str())))
            }
            _ => Ok(None),
        }
    }
}

/// Shared state of the HTTP handlers
pub struct LongPollService {
    context: Arc<WatchContext>,
    keepalive: Duration,
}

impl std::fmt::Debug for LongPollService {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("LongPollService")
            .field("keepalive", &self.keepalive)
            .finish_non_exhaustive()
    }
}

impl LongPollService {
    pub fn new(
        context: Arc<WatchContext>,
        keepalive: Duration,
    ) -> Self {
        Self { context, keepalive }
    }

    /// Validates the request, prepares routing and starts the session.
    ///
    /// # Errors
    /// Client errors for malformed bodies or headers, holder initialization
    /// errors otherwise. No stream exists when this fails.
    pub async fn open(
        &self,
        body: &[u8],
        query: LongPollQuery,
        headers: &LongPollHeaders,
    ) -> Result<Response> {
        let mut request = SubscriptionRequest::from_slice(body)?;
        let route_mode = headers.route_mode()?;
        let source = headers.source()?;
        let source_app = source.as_ref().map(|s| s.application.clone());

        let policy = self.context.policy.load_full();
        if let Some(force) = policy.force_routing() {
            force.apply(&mut request, source_app.as_deref())?;
        }

        let mut hijack = RouteHijack::new(policy.clone(), source.clone(), route_mode);
        hijack.prepare(&self.context.hub, &request).await;
        hijack.hijack_request(&mut request)?;

        let options = WatcherOptions {
            with_initial: query.trigger.unwrap_or(true),
            life_span: query.life_span.filter(|s| *s > 0).map(Duration::from_secs),
            source,
            route_mode,
        };
        let mut watcher = TreeWatcher::new(self.context.clone(), options);
        watcher.apply_request(&request)?;
        let stream = watcher.start().await?;

        info!(
            watcher = watcher.id(),
            subscriptions = request.len(),
            %route_mode,
            source_app = source_app.as_deref().unwrap_or("-"),
            hijacked = hijack.is_active(),
            "Long poll opened"
        );

        let lines = with_keepalive(hijack.hijack_response(stream), self.keepalive).map(|m| encode_ndjson(&m));
        let mut response = Response::new(Body::wrap_stream(lines));
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(NDJSON));
        Ok(response)
    }
}

/// HTTP status for errors raised before the stream starts
pub fn status_for(error: &Error) -> StatusCode {
    if error.is_client_error() {
        StatusCode::BAD_REQUEST
    } else if error.is_timeout() {
        StatusCode::GATEWAY_TIMEOUT
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

fn error_reply(error: &Error) -> Response {
    let status = status_for(error);
    if status.is_server_error() {
        warn!(%status, error = %error, "Long poll rejected");
    } else {
        debug!(%status, error = %error, "Long poll rejected");
    }
    warp::reply::with_status(warp::reply::json(&json!({ "error": error.to_string() })), status).into_response()
}

fn with_service(service: Arc<LongPollService>) -> impl Filter<Extract = (Arc<LongPollService>,), Error = Infallible> + Clone {
    warp::any().map(move || service.clone())
}

fn caller_headers() -> impl Filter<Extract = (LongPollHeaders,), Error = Rejection> + Clone {
    warp::header::optional::<String>(HEADER_ROUTE_MODE)
        .and(warp::header::optional::<String>(HEADER_CLUSTER_NAME))
        .and(warp::header::optional::<String>(HEADER_APPLICATION_NAME))
        .map(|route_mode, cluster, application| LongPollHeaders {
            route_mode,
            cluster,
            application,
        })
}

/// `POST /api/data/long_polling`
pub fn routes(service: Arc<LongPollService>) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path!("api" / "data" / "long_polling")
        .and(warp::post())
        .and(warp::query::<LongPollQuery>())
        .and(caller_headers())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::bytes())
        .and(with_service(service))
        .and_then(long_polling_handler)
}

async fn long_polling_handler(
    query: LongPollQuery,
    headers: LongPollHeaders,
    body: Bytes,
    service: Arc<LongPollService>,
) -> std::result::Result<Response, Rejection> {
    match service.open(&body, query, &headers).await {
        Ok(response) => Ok(response),
        Err(e) => Ok(error_reply(&e)),
    }
}

/// Serves the long-poll endpoint until `shutdown` fires
pub async fn start_server(
    addr: SocketAddr,
    service: Arc<LongPollService>,
    mut shutdown_signal: watch::Receiver<()>,
) -> Result<()> {
    let (addr, server) = warp::serve(routes(service))
        .try_bind_with_graceful_shutdown(addr, async move {
            let _ = shutdown_signal.changed().await;
        })
        .map_err(|e| {
            error!(%addr, error = %e, "Failed to bind long-poll server");
            Error::Fatal(format!("failed to bind {addr}: {e}"))
        })?;
    info!(%addr, "Long-poll server listening");
    server.await;
    Ok(())
}
