use thiserror::Error;

/// バックエンドストア層のエラー
///
/// 呼び出し側からは基本的に不透明なものとして扱う。
/// `Conflict` のみ共有の重複として意味を持つ。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Conflicting row: {0}")]
    Conflict(String),

    #[error("Malformed row: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TodoError {
    #[error("User not authenticated")]
    NotAuthenticated,

    #[error("Todo is already shared with {0}")]
    AlreadyShared(String),

    #[error("Todo not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type TodoResult<T> = Result<T, TodoError>;
