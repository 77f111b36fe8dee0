//! クライアント側の Todo キャッシュ
//!
//! 1 ユーザー分の一覧・読み込み中フラグ・エラーメッセージを保持する。
//! 更新系はサービス呼び出しが成功してからローカルの一覧に反映し、
//! 共有の変更だけは共有情報を取り直すために一覧全体を再取得する。

use crate::service::TodoService;
use chrono::{DateTime, Utc};
use domain::{NewTodo, Permission, Todo, TodoError, TodoId, TodoResult};
use shared::SessionContext;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// キャッシュの状態（フラグから導出）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePhase {
    Idle,
    Loading,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Default)]
struct CacheState {
    /// 最初の取得が成功するまでは `None`
    todos: Option<Vec<Todo>>,
    loading: bool,
    error: Option<String>,
}

impl CacheState {
    fn phase(&self) -> CachePhase {
        if self.loading {
            CachePhase::Loading
        } else if self.error.is_some() {
            CachePhase::Failed
        } else if self.todos.is_some() {
            CachePhase::Ready
        } else {
            CachePhase::Idle
        }
    }

    fn update_todo(&mut self, id: &TodoId, f: impl FnOnce(&mut Todo)) {
        if let Some(todo) = self
            .todos
            .as_mut()
            .and_then(|todos| todos.iter_mut().find(|todo| &todo.id == id))
        {
            f(todo);
        }
    }
}

/// 表示用のスナップショット
#[derive(Debug, Clone, PartialEq)]
pub struct TodoCacheSnapshot {
    pub todos: Vec<Todo>,
    pub loading: bool,
    pub error: Option<String>,
    pub phase: CachePhase,
}

pub struct TodoCache {
    service: TodoService,
    session: Mutex<SessionContext>,
    state: Mutex<CacheState>,
    /// 最後に発行した取得の世代
    generation: AtomicU64,
}

impl TodoCache {
    pub fn new(service: TodoService, session: SessionContext) -> Self {
        Self {
            service,
            session: Mutex::new(session),
            state: Mutex::new(CacheState::default()),
            generation: AtomicU64::new(0),
        }
    }

    /// 認証済みであれば初回の取得を行う
    pub async fn mount(&self) {
        if self.session().session().is_some() {
            self.refetch().await;
        }
    }

    /// 身元が変わった場合のみ取り直す
    ///
    /// 変更前に発行された取得の応答は捨てる。未認証になった場合は状態を空に戻す。
    pub async fn set_identity(&self, session: SessionContext) {
        {
            let mut current = lock(&self.session);
            if *current == session {
                return;
            }
            *current = session;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);

        if self.session().session().is_none() {
            *self.state() = CacheState::default();
            return;
        }
        self.refetch().await;
    }

    /// 一覧全体を取り直す
    ///
    /// 後から発行された取得がある場合、古い応答は捨てる。
    pub async fn refetch(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut state = self.state();
            state.loading = true;
            state.error = None;
        }

        let session = self.session();
        let result = match session.session() {
            Some(user) => {
                self.service
                    .list_todos(&user.user_id, Some(&user.email))
                    .await
            }
            None => Err(TodoError::NotAuthenticated),
        };

        let mut state = self.state();
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(generation, "Discarding stale todo list response");
            return;
        }

        state.loading = false;
        match result {
            Ok(todos) => state.todos = Some(todos),
            Err(e) => {
                warn!(error = %e, "Failed to fetch todos");
                state.error = Some(format!("Failed to fetch todos: {e}"));
            }
        }
    }

    pub async fn toggle_completion(&self, id: &TodoId, current_status: bool) {
        self.clear_error();
        match self.service.toggle_completion(id, current_status).await {
            Ok(()) => self
                .state()
                .update_todo(id, |todo| todo.completed = !current_status),
            Err(e) => self.fail("Failed to update todo status", e),
        }
    }

    /// 確認に同意した場合のみ削除する。削除したら `true`
    pub async fn delete_todo(&self, id: &TodoId, confirm: impl FnOnce() -> bool) -> bool {
        if !confirm() {
            return false;
        }

        self.clear_error();
        match self.service.delete_todo(id).await {
            Ok(()) => {
                if let Some(todos) = self.state().todos.as_mut() {
                    todos.retain(|todo| &todo.id != id);
                }
                true
            }
            Err(e) => {
                self.fail("Failed to delete todo", e);
                false
            }
        }
    }

    pub async fn set_due_date(&self, id: &TodoId, due_date: Option<DateTime<Utc>>) {
        self.clear_error();
        match self.service.set_due_date(id, due_date).await {
            Ok(()) => self.state().update_todo(id, |todo| todo.due_date = due_date),
            Err(e) => self.fail("Failed to update due date", e),
        }
    }

    /// 成功したら一覧を取り直して `true`
    pub async fn share_todo(&self, id: &TodoId, email: &str) -> bool {
        self.clear_error();
        let session = self.session();
        let result = self.service.share_todo(&session, id, email).await;
        self.after_share_change("Failed to share todo", result.map(|_| ()))
            .await
    }

    pub async fn remove_share(&self, id: &TodoId, email: &str) -> bool {
        self.clear_error();
        let result = self.service.remove_share(id, email).await;
        self.after_share_change("Failed to remove share", result)
            .await
    }

    pub async fn update_share_permission(
        &self,
        id: &TodoId,
        email: &str,
        permission: Permission,
    ) -> bool {
        self.clear_error();
        let result = self
            .service
            .update_share_permission(id, email, permission)
            .await;
        self.after_share_change("Failed to update share permission", result)
            .await
    }

    /// 作成した Todo を先頭に追加する。失敗は状態に記録した上で呼び出し元にも返す。
    ///
    /// 一度も取得していない場合は一覧を作らず、次の取得に任せる。
    pub async fn create_todo(&self, new_todo: NewTodo) -> TodoResult<Todo> {
        self.clear_error();
        match self.service.create_todo(new_todo).await {
            Ok(todo) => {
                if let Some(todos) = self.state().todos.as_mut() {
                    let mut created = todo.clone();
                    created.todo_shares = Vec::new();
                    todos.insert(0, created);
                }
                Ok(todo)
            }
            Err(e) => {
                self.fail("Failed to create todo", &e);
                Err(e)
            }
        }
    }

    pub fn clear_error(&self) {
        self.state().error = None;
    }

    pub fn snapshot(&self) -> TodoCacheSnapshot {
        let state = self.state();
        TodoCacheSnapshot {
            todos: state.todos.clone().unwrap_or_default(),
            loading: state.loading,
            error: state.error.clone(),
            phase: state.phase(),
        }
    }

    /// 詳細表示用に 1 件引く
    pub fn todo(&self, id: &TodoId) -> Option<Todo> {
        self.state()
            .todos
            .as_ref()
            .and_then(|todos| todos.iter().find(|todo| &todo.id == id).cloned())
    }

    async fn after_share_change(&self, context: &str, result: TodoResult<()>) -> bool {
        match result {
            Ok(()) => {
                self.refetch().await;
                true
            }
            Err(e) => {
                self.fail(context, e);
                false
            }
        }
    }

    fn fail(&self, context: &str, error: impl Display) {
        warn!(error = %error, "{context}");
        self.state().error = Some(format!("{context}: {error}"));
    }

    fn session(&self) -> SessionContext {
        lock(&self.session).clone()
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        lock(&self.state)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
