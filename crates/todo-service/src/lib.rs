//! Todo のアクセス層とクライアント側キャッシュ
//!
//! `TodoService` はストアへの問い合わせ（所有分と共有分のマージを含む）を担い、
//! `TodoCache` はその結果を 1 ユーザー分保持してローカルに更新を反映する。

pub mod cache;
pub mod service;

pub use cache::{CachePhase, TodoCache, TodoCacheSnapshot};
pub use service::TodoService;
