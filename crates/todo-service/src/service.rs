use chrono::{DateTime, Utc};
use domain::{
    NewTodo, Permission, StoreError, Todo, TodoError, TodoId, TodoPatch, TodoResult, TodoShare,
    UserId,
};
use infrastructure::{TodoFilter, TodoStore};
use shared::SessionContext;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Todo の取得・更新・共有をまとめたアクセス層
#[derive(Clone)]
pub struct TodoService {
    store: Arc<dyn TodoStore>,
}

impl TodoService {
    pub fn new(store: Arc<dyn TodoStore>) -> Self {
        Self { store }
    }

    /// ユーザーが所有する Todo と共有された Todo を新しい順で返す
    ///
    /// メールアドレスが無い場合は所有分のみ。同じ Todo が両方に現れた場合は所有分を残す。
    #[instrument(skip(self))]
    pub async fn list_todos(
        &self,
        user_id: &UserId,
        user_email: Option<&str>,
    ) -> TodoResult<Vec<Todo>> {
        if user_id.is_empty() {
            return Err(TodoError::Validation("No userId provided".to_string()));
        }

        let todos = match user_email.filter(|email| !email.is_empty()) {
            Some(email) => {
                let (owned, shared) = tokio::try_join!(
                    self.store.select_todos(TodoFilter::Owner(user_id.clone())),
                    self.store
                        .select_todos(TodoFilter::SharedWith(email.to_string())),
                )?;
                merge_newest_first(owned, shared)
            }
            None => {
                self.store
                    .select_todos(TodoFilter::Owner(user_id.clone()))
                    .await?
            }
        };

        debug!(count = todos.len(), "Todos listed");
        Ok(todos)
    }

    /// 共有行付きで 1 件取得する。0 件・複数件はどちらも `NotFound`
    #[instrument(skip(self), fields(todo_id = %id))]
    pub async fn get_todo_by_id(&self, id: &TodoId) -> TodoResult<Todo> {
        let rows = self.store.select_todos(TodoFilter::Id(id.clone())).await?;
        match <[Todo; 1]>::try_from(rows) {
            Ok([todo]) => Ok(todo),
            Err(rows) => {
                debug!(rows = rows.len(), "Todo lookup did not match exactly one row");
                Err(TodoError::NotFound(id.to_string()))
            }
        }
    }

    /// 呼び出し元が把握している状態を反転する（楽観ロックなし、後勝ち）
    #[instrument(skip(self), fields(todo_id = %id))]
    pub async fn toggle_completion(&self, id: &TodoId, current_status: bool) -> TodoResult<()> {
        self.store
            .update_todo(id, TodoPatch::completion(!current_status, Utc::now()))
            .await?;
        info!(completed = !current_status, "Todo completion toggled");
        Ok(())
    }

    /// `None` で期限をクリアする。どちらの場合も `updated_at` を更新する。
    #[instrument(skip(self), fields(todo_id = %id))]
    pub async fn set_due_date(
        &self,
        id: &TodoId,
        due_date: Option<DateTime<Utc>>,
    ) -> TodoResult<()> {
        self.store
            .update_todo(id, TodoPatch::due_date(due_date, Utc::now()))
            .await?;
        info!(cleared = due_date.is_none(), "Todo due date updated");
        Ok(())
    }

    /// 共有行ごと削除する
    #[instrument(skip(self), fields(todo_id = %id))]
    pub async fn delete_todo(&self, id: &TodoId) -> TodoResult<()> {
        self.store.delete_todo_with_shares(id).await?;
        info!("Todo deleted");
        Ok(())
    }

    /// 認証済みユーザーとして Todo を共有する。権限は常に `read_write`。
    #[instrument(skip(self, session), fields(todo_id = %id))]
    pub async fn share_todo(
        &self,
        session: &SessionContext,
        id: &TodoId,
        email: &str,
    ) -> TodoResult<TodoShare> {
        let owner = session.require_user()?;
        let email = normalize_email(email)?;

        if self.store.select_share(id, &email).await?.is_some() {
            return Err(TodoError::AlreadyShared(email));
        }

        let share = TodoShare {
            todo_id: id.clone(),
            shared_with_email: email.clone(),
            permission: Permission::ReadWrite,
            owner_email: owner.email.clone(),
            created_at: Utc::now(),
        };

        match self.store.insert_share(share.clone()).await {
            Ok(()) => {
                info!(shared_with = %email, "Todo shared");
                Ok(share)
            }
            // 確認と挿入の間に別の共有が入った場合
            Err(StoreError::Conflict(_)) => Err(TodoError::AlreadyShared(email)),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), fields(todo_id = %id))]
    pub async fn remove_share(&self, id: &TodoId, email: &str) -> TodoResult<()> {
        self.store.delete_share(id, email).await?;
        info!(shared_with = %email, "Todo share removed");
        Ok(())
    }

    #[instrument(skip(self), fields(todo_id = %id))]
    pub async fn update_share_permission(
        &self,
        id: &TodoId,
        email: &str,
        permission: Permission,
    ) -> TodoResult<()> {
        self.store.update_share(id, email, permission).await?;
        info!(shared_with = %email, %permission, "Todo share permission updated");
        Ok(())
    }

    #[instrument(skip(self, new_todo), fields(user_id = %new_todo.user_id))]
    pub async fn create_todo(&self, new_todo: NewTodo) -> TodoResult<Todo> {
        let todo = self.store.insert_todo(new_todo).await?;
        info!(todo_id = %todo.id, "Todo created");
        Ok(todo)
    }
}

/// 所有分を優先して重複を除き、`created_at` 降順に並べる
fn merge_newest_first(owned: Vec<Todo>, shared: Vec<Todo>) -> Vec<Todo> {
    let mut seen: HashSet<TodoId> = owned.iter().map(|todo| todo.id.clone()).collect();
    let mut todos = owned;
    for todo in shared {
        if seen.insert(todo.id.clone()) {
            todos.push(todo);
        }
    }
    todos.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    todos
}

fn normalize_email(email: &str) -> TodoResult<String> {
    let email = email.trim();
    if email.is_empty() {
        return Err(TodoError::Validation("Email address is required".to_string()));
    }
    if !email.contains('@') {
        return Err(TodoError::Validation(format!(
            "Invalid email address: {email}"
        )));
    }
    Ok(email.to_string())
}
