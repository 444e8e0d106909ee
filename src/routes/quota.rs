use axum::{Extension, Json};

use crate::{keeper::Stats, result::ApiResult};

/// Quota left for the calling key, as recorded by the admission middleware
/// for this very request.
pub async fn current_quota(Extension(stats): Extension<Stats>) -> Json<ApiResult<Stats>> {
    Json(ApiResult::success(stats))
}
