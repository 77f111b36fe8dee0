//! 認証プロバイダとの境界
//!
//! 呼び出し元の身元はアンビエントな状態から引かず、`SessionContext` として
//! 明示的にアクセス層へ渡す。

use chrono::Utc;
use domain::{TodoError, UserId};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    pub exp: i64,
    pub iat: i64,
}

/// 認証済みユーザー
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: UserId,
    pub email: String,
}

impl Session {
    pub fn new(user_id: UserId, email: impl Into<String>) -> Self {
        Self {
            user_id,
            email: email.into(),
        }
    }
}

impl From<Claims> for Session {
    fn from(claims: Claims) -> Self {
        Self {
            user_id: UserId::from_string(claims.sub),
            email: claims.email,
        }
    }
}

/// 呼び出し元の身元。未認証の場合もある。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    session: Option<Session>,
}

impl SessionContext {
    pub fn anonymous() -> Self {
        Self { session: None }
    }

    pub fn authenticated(session: Session) -> Self {
        Self {
            session: Some(session),
        }
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// 認証が必要な操作の入口で使う
    pub fn require_user(&self) -> Result<&Session, TodoError> {
        self.session.as_ref().ok_or(TodoError::NotAuthenticated)
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
}

/// HS256 で署名されたアクセストークンを検証する
#[derive(Clone)]
pub struct TokenVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Session, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation)?;
        Ok(data.claims.into())
    }

    /// 開発用・テスト用のトークン発行
    pub fn issue(&self, session: &Session, ttl_secs: i64) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: session.user_id.as_str().to_string(),
            email: session.email.clone(),
            exp: now + ttl_secs,
            iat: now,
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }
}
