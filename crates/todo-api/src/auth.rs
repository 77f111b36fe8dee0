use crate::{error::ApiError, AppState};
use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use shared::SessionContext;
use tracing::debug;

/// `Authorization: Bearer <JWT>` から組み立てた呼び出し元
///
/// ヘッダが無い場合は未認証のコンテキストになり、認証の要否は各操作が判断する。
#[derive(Debug, Clone)]
pub struct Caller(pub SessionContext);

#[async_trait]
impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(header) = parts.headers.get(AUTHORIZATION) else {
            return Ok(Caller(SessionContext::anonymous()));
        };

        let token = header
            .to_str()
            .ok()
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(|| ApiError::Unauthorized("Invalid authorization header".to_string()))?;

        let session = state.verifier.verify(token).map_err(|e| {
            debug!(error = %e, "Rejected bearer token");
            ApiError::Unauthorized(e.to_string())
        })?;

        Ok(Caller(SessionContext::authenticated(session)))
    }
}
