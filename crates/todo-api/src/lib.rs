//! HTTP API（axum）
//!
//! `TodoService` の各操作を REST 風のルートとして公開する。
//! 呼び出し元は Bearer トークンから `SessionContext` として取り出す。

pub mod auth;
pub mod error;

use auth::Caller;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use chrono::Utc;
use domain::{
    due_date, DueStatus, NewTodo, Permission, Todo, TodoError, TodoId, TodoShare,
};
use error::ApiError;
use infrastructure::InMemoryStore;
use serde::{Deserialize, Serialize};
use shared::{Session, TokenVerifier};
use std::sync::Arc;
use todo_service::TodoService;

/// アプリケーションの共有状態
#[derive(Clone)]
pub struct AppState {
    pub service: TodoService,
    pub verifier: TokenVerifier,
}

impl AppState {
    pub fn new(service: TodoService, verifier: TokenVerifier) -> Self {
        Self { service, verifier }
    }

    /// InMemory ストアで組み立てる（開発/テスト用）
    pub fn in_memory(verifier: TokenVerifier) -> Self {
        Self::new(TodoService::new(Arc::new(InMemoryStore::new())), verifier)
    }
}

/// 外部から状態を注入してルータを構築する
pub fn app_with_state(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/todos", get(list_todos).post(create_todo))
        .route(
            "/todos/:id",
            get(get_todo).patch(patch_todo).delete(delete_todo),
        )
        .route("/todos/:id/shares", post(share_todo))
        .route(
            "/todos/:id/shares/:email",
            patch(update_share_permission).delete(remove_share),
        )
        .with_state(state)
}

/// 期限の表示情報を付けた Todo
#[derive(Debug, Serialize)]
pub struct TodoView {
    #[serde(flatten)]
    pub todo: Todo,
    pub due_status: Option<DueStatus>,
    pub due_date_display: Option<String>,
}

impl From<Todo> for TodoView {
    fn from(todo: Todo) -> Self {
        let now = Utc::now();
        Self {
            due_status: todo.due_status(now),
            due_date_display: todo.due_date.map(due_date::format_due_date),
            todo,
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthBody { status: "ok" }))
}

/// Todo に対して求める権限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
    Owner,
}

/// 所有者はすべて可。共有先は権限に応じて読み取り・更新のみ。
/// 共有されていないユーザーには存在自体を見せない。
fn authorize(todo: &Todo, session: &Session, access: Access) -> Result<(), ApiError> {
    if todo.is_owned_by(&session.user_id) {
        return Ok(());
    }

    let share = todo
        .share_for(&session.email)
        .ok_or_else(|| TodoError::NotFound(todo.id.to_string()))?;

    match access {
        Access::Read => Ok(()),
        Access::Write if share.permission.can_write() => Ok(()),
        Access::Write => Err(ApiError::Forbidden(
            "Todo is shared read-only".to_string(),
        )),
        Access::Owner => Err(ApiError::Forbidden(
            "Only the owner can do this".to_string(),
        )),
    }
}

/// 認証を要求し、対象 Todo への権限を確認して返す
async fn load_authorized(
    state: &AppState,
    caller: &Caller,
    id: &TodoId,
    access: Access,
) -> Result<Todo, ApiError> {
    let session = caller.0.require_user()?;
    let todo = state.service.get_todo_by_id(id).await?;
    authorize(&todo, session, access)?;
    Ok(todo)
}

async fn list_todos(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<Json<Vec<TodoView>>, ApiError> {
    let session = caller.0.require_user()?;
    let todos = state
        .service
        .list_todos(&session.user_id, Some(&session.email))
        .await?;
    Ok(Json(todos.into_iter().map(TodoView::from).collect()))
}

/// POST /todos リクエスト
#[derive(Debug, Deserialize)]
struct CreateTodoRequest {
    content: String,
    description: Option<String>,
    due_date: Option<String>,
}

async fn create_todo(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<CreateTodoRequest>,
) -> Result<(StatusCode, Json<TodoView>), ApiError> {
    let session = caller.0.require_user()?;
    let due_date = match req.due_date.as_deref() {
        Some(input) => due_date::parse_due_date(input)?,
        None => None,
    };
    let new_todo = NewTodo::new(session.user_id.clone(), &req.content)?
        .with_description(req.description.as_deref())
        .with_due_date(due_date);

    let todo = state.service.create_todo(new_todo).await?;
    Ok((StatusCode::CREATED, Json(todo.into())))
}

async fn get_todo(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<Json<TodoView>, ApiError> {
    let todo = load_authorized(&state, &caller, &TodoId::from_string(id), Access::Read).await?;
    Ok(Json(todo.into()))
}

/// PATCH /todos/:id リクエスト（内部タグ方式）
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum PatchTodoRequest {
    Toggle { current_status: bool },
    SetDueDate { due_date: Option<String> },
}

async fn patch_todo(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(req): Json<PatchTodoRequest>,
) -> Result<StatusCode, ApiError> {
    let id = TodoId::from_string(id);
    load_authorized(&state, &caller, &id, Access::Write).await?;

    match req {
        PatchTodoRequest::Toggle { current_status } => {
            state.service.toggle_completion(&id, current_status).await?
        }
        PatchTodoRequest::SetDueDate { due_date } => {
            let due_date = match due_date.as_deref() {
                Some(input) => due_date::parse_due_date(input)?,
                None => None,
            };
            state.service.set_due_date(&id, due_date).await?
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_todo(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = TodoId::from_string(id);
    load_authorized(&state, &caller, &id, Access::Owner).await?;
    state.service.delete_todo(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /todos/:id/shares リクエスト
#[derive(Debug, Deserialize)]
struct ShareTodoRequest {
    email: String,
}

async fn share_todo(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(req): Json<ShareTodoRequest>,
) -> Result<(StatusCode, Json<TodoShare>), ApiError> {
    let id = TodoId::from_string(id);
    load_authorized(&state, &caller, &id, Access::Owner).await?;
    let share = state.service.share_todo(&caller.0, &id, &req.email).await?;
    Ok((StatusCode::CREATED, Json(share)))
}

/// PATCH /todos/:id/shares/:email リクエスト
#[derive(Debug, Deserialize)]
struct UpdatePermissionRequest {
    permission: String,
}

async fn update_share_permission(
    State(state): State<AppState>,
    caller: Caller,
    Path((id, email)): Path<(String, String)>,
    Json(req): Json<UpdatePermissionRequest>,
) -> Result<StatusCode, ApiError> {
    let id = TodoId::from_string(id);
    load_authorized(&state, &caller, &id, Access::Owner).await?;
    let permission: Permission = req.permission.parse()?;
    state
        .service
        .update_share_permission(&id, &email, permission)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_share(
    State(state): State<AppState>,
    caller: Caller,
    Path((id, email)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let id = TodoId::from_string(id);
    load_authorized(&state, &caller, &id, Access::Owner).await?;
    state.service.remove_share(&id, &email).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{self, Body},
        http::Request,
    };
    use tower::ServiceExt; // for `oneshot`

    #[tokio::test]
    async fn get_health_returns_ok() {
        let app = app_with_state(AppState::in_memory(TokenVerifier::new("secret")));

        let request = Request::builder()
            .method("GET")
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[test]
    fn read_only_share_cannot_write() {
        let owner = domain::UserId::new();
        let mut todo = NewTodo::new(owner, "task")
            .unwrap()
            .into_todo(TodoId::new(), Utc::now());
        todo.todo_shares.push(TodoShare {
            todo_id: todo.id.clone(),
            shared_with_email: "b@x.com".to_string(),
            permission: Permission::Read,
            owner_email: "a@x.com".to_string(),
            created_at: Utc::now(),
        });
        let reader = Session::new(domain::UserId::new(), "b@x.com");
        let stranger = Session::new(domain::UserId::new(), "c@x.com");

        assert!(authorize(&todo, &reader, Access::Read).is_ok());
        assert!(matches!(
            authorize(&todo, &reader, Access::Write),
            Err(ApiError::Forbidden(_))
        ));
        assert!(matches!(
            authorize(&todo, &stranger, Access::Read),
            Err(ApiError::Todo(TodoError::NotFound(_)))
        ));
    }
}
