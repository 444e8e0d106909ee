use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Request, header::InvalidHeaderName},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::{
    config::Config,
    error::AppError,
    keeper::{Admission, Key, Keeper, Stats},
};

/// Admission middleware state: where to find the key, which keeper to ask and
/// how to name the quota headers.
#[derive(Clone)]
pub struct Gatekeeper {
    keeper: Arc<dyn Keeper>,
    key_header: HeaderName,
    limit_header: HeaderName,
    remaining_header: HeaderName,
}

impl Gatekeeper {
    /// Key read from `APIKEY`, headers prefixed with `X-API-`.
    pub fn new(keeper: Arc<dyn Keeper>) -> Self {
        Self {
            keeper,
            key_header: HeaderName::from_static("apikey"),
            limit_header: HeaderName::from_static("x-api-limit"),
            remaining_header: HeaderName::from_static("x-api-remaining"),
        }
    }

    pub fn from_config(keeper: Arc<dyn Keeper>, config: &Config) -> Result<Self, InvalidHeaderName> {
        Self::with_headers(keeper, &config.key_header, &config.header_prefix)
    }

    pub fn with_headers(
        keeper: Arc<dyn Keeper>,
        key_header: &str,
        prefix: &str,
    ) -> Result<Self, InvalidHeaderName> {
        Ok(Self {
            keeper,
            key_header: HeaderName::try_from(key_header)?,
            limit_header: HeaderName::try_from(format!("{prefix}Limit"))?,
            remaining_header: HeaderName::try_from(format!("{prefix}Remaining"))?,
        })
    }

    fn extract_key(&self, headers: &HeaderMap) -> Option<Key> {
        headers
            .get(&self.key_header)
            .and_then(|h| h.to_str().ok())
            .filter(|raw| !raw.is_empty())
            .map(Key::from)
    }

    fn attach_stats(&self, headers: &mut HeaderMap, stats: Stats) {
        headers.insert(self.limit_header.clone(), HeaderValue::from(stats.limit));
        headers.insert(self.remaining_header.clone(), HeaderValue::from(stats.remaining));
    }

    pub async fn check(self: Arc<Self>, mut req: Request<Body>, next: Next) -> Result<Response, AppError> {
        let key = self.extract_key(req.headers()).ok_or(AppError::MissingKey)?;

        let stats = match self.keeper.allow(&key).await {
            Ok(Admission::Granted(stats)) => stats,
            Ok(Admission::Denied(stats)) => {
                tracing::info!(key = %key, limit = stats.limit, "request refused, limit reached");
                return Err(AppError::LimitReached);
            }
            Err(e) if e.is_unknown_key() => {
                tracing::info!(key = %key, "request refused, unknown API key");
                return Err(AppError::UnknownKey);
            }
            Err(e) => {
                tracing::error!(key = %key, error = %e, "unable to check key");
                return Err(e.into());
            }
        };

        req.extensions_mut().insert(stats);
        let mut response = next.run(req).await;
        self.attach_stats(response.headers_mut(), stats);
        Ok(response)
    }
}

pub async fn check_quota(
    State(gatekeeper): State<Arc<Gatekeeper>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    match gatekeeper.check(req, next).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}
