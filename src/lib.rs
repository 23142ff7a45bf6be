//! # partial-serve
//!
//! Single-range HTTP byte serving for [`axum`][1], over content that may
//! still be arriving.
//!
//! A request resolves to a [`ContentHandle`], a resource with a fixed
//! declared length that can open positioned readers. [`range::parse`]
//! classifies the `Range` header against that length and [`Ranged`] turns
//! the outcome into a `206`, `416` or `HEAD` response whose body streams in
//! bounded chunks.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use axum::http::{header, HeaderMap, Method};
//! use axum::Router;
//! use axum::routing::get;
//!
//! use partial_serve::{ContentHandle, FileHandle, Ranged, RangeOutcome};
//!
//! async fn file(method: Method, headers: HeaderMap) -> Ranged {
//!     let handle = FileHandle::open("movie.mp4").await.unwrap();
//!     let outcome = RangeOutcome::from_header(headers.get(header::RANGE), handle.length());
//!     Ranged::new(Arc::new(handle), method, outcome)
//! }
//!
//! let _app = Router::<()>::new().route("/", get(file));
//! ```
//!
//! [1]: https://docs.rs/axum

mod error;
mod file;
mod handle;
mod stream;

pub mod catalog;
pub mod partial;
pub mod range;
pub mod server;

use std::sync::Arc;

use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum_extra::headers::{AcceptRanges, ContentLength, ContentRange};
use axum_extra::TypedHeader;
use tokio_util::sync::CancellationToken;

pub use error::{Error, Result};
pub use file::FileHandle;
pub use handle::{content_type_for, ContentHandle, ContentReader};
pub use range::{ByteInterval, MalformedRange, RangeOutcome};
pub use stream::{AbortCause, RangedBody, StreamConfig, StreamResult};

/// The main responder type. Implements [`IntoResponse`].
pub struct Ranged {
    handle: Arc<dyn ContentHandle>,
    method: Method,
    outcome: RangeOutcome,
    config: StreamConfig,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Ranged {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ranged")
            .field("name", &self.handle.name())
            .field("method", &self.method)
            .field("outcome", &self.outcome)
            .finish()
    }
}

impl Ranged {
    /// Construct a ranged response over a handle and the already resolved
    /// range outcome for its length. Any method other than `HEAD` is served
    /// as `GET`.
    pub fn new(handle: Arc<dyn ContentHandle>, method: Method, outcome: RangeOutcome) -> Self {
        Ranged { handle, method, outcome, config: StreamConfig::default(), cancel: CancellationToken::new() }
    }

    pub fn with_config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    /// Cancelling `token` ends the body stream, e.g. on server shutdown.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Responds to the request, returning headers and body as
    /// [`RangedResponse`]. Returns [`RangeNotSatisfiable`] for malformed and
    /// unsatisfiable ranges alike.
    ///
    /// A `GET` without a `Range` header arrives here as
    /// [`MalformedRange::Missing`] and is answered with `416` rather than the
    /// whole resource.
    pub fn try_respond(self) -> Result<RangedResponse, RangeNotSatisfiable> {
        let total_bytes = self.handle.length();
        let content_type = self.handle.content_type();

        if self.method == Method::HEAD {
            return Ok(RangedResponse::Head {
                content_length: ContentLength(total_bytes),
                content_type,
            });
        }

        let interval = match self.outcome.into_interval(total_bytes) {
            Ok(interval) => interval,
            Err(reason) => {
                tracing::debug!(name = self.handle.name(), total_bytes, %reason, "range rejected");
                return Err(RangeNotSatisfiable::new(total_bytes, content_type, reason));
            }
        };

        // HTTP byte ranges are inclusive
        let content_range = ContentRange::bytes(interval.start..=interval.end, total_bytes).map_err(|_| {
            RangeNotSatisfiable::new(total_bytes, content_type, Error::UnsatisfiableRange { total: total_bytes })
        })?;
        let content_length = ContentLength(interval.len());
        let body = RangedBody::new(self.handle, interval, self.config).with_cancellation(self.cancel);

        Ok(RangedResponse::Partial { content_range, content_length, content_type, body })
    }
}

impl IntoResponse for Ranged {
    fn into_response(self) -> Response {
        self.try_respond().into_response()
    }
}

/// Error type indicating that the requested range was malformed or not
/// satisfiable. Implements [`IntoResponse`].
#[derive(Debug)]
pub struct RangeNotSatisfiable {
    pub content_range: ContentRange,
    pub content_type: &'static str,
    /// [`Error::MalformedRange`] or [`Error::UnsatisfiableRange`].
    pub reason: Error,
}

impl RangeNotSatisfiable {
    fn new(total_bytes: u64, content_type: &'static str, reason: Error) -> Self {
        RangeNotSatisfiable {
            content_range: ContentRange::unsatisfied_bytes(total_bytes),
            content_type,
            reason,
        }
    }
}

impl IntoResponse for RangeNotSatisfiable {
    fn into_response(self) -> Response {
        let status = StatusCode::RANGE_NOT_SATISFIABLE;
        let headers = [(header::CONTENT_TYPE, HeaderValue::from_static(self.content_type))];
        (status, TypedHeader(AcceptRanges::bytes()), TypedHeader(self.content_range), headers, ()).into_response()
    }
}

/// Data type containing computed headers and body for a range response.
/// Implements [`IntoResponse`].
#[derive(Debug)]
pub enum RangedResponse {
    /// Metadata only, for `HEAD` requests.
    Head {
        content_length: ContentLength,
        content_type: &'static str,
    },
    Partial {
        content_range: ContentRange,
        content_length: ContentLength,
        content_type: &'static str,
        body: RangedBody,
    },
}

impl IntoResponse for RangedResponse {
    fn into_response(self) -> Response {
        let accept_ranges = TypedHeader(AcceptRanges::bytes());

        match self {
            RangedResponse::Head { content_length, content_type } => {
                let headers = [(header::CONTENT_TYPE, HeaderValue::from_static(content_type))];
                (StatusCode::OK, accept_ranges, TypedHeader(content_length), headers).into_response()
            }
            RangedResponse::Partial { content_range, content_length, content_type, body } => {
                let headers = [(header::CONTENT_TYPE, HeaderValue::from_static(content_type))];
                (
                    StatusCode::PARTIAL_CONTENT,
                    accept_ranges,
                    TypedHeader(content_range),
                    TypedHeader(content_length),
                    headers,
                    body,
                )
                    .into_response()
            }
        }
    }
}
