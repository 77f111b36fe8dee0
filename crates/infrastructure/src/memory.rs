use crate::store::{TodoFilter, TodoStore};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use domain::{NewTodo, Permission, StoreError, Todo, TodoId, TodoPatch, TodoShare};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// ストアに対して発行された操作（テスト観測用）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    SelectTodos(TodoFilter),
    SelectShare(TodoId, String),
    InsertTodo,
    UpdateTodo(TodoId),
    DeleteTodo(TodoId),
    DeleteShares(TodoId),
    DeleteTodoWithShares(TodoId),
    InsertShare(TodoId, String),
    UpdateShare(TodoId, String),
    DeleteShare(TodoId, String),
}

#[derive(Default)]
struct Tables {
    todos: HashMap<TodoId, Todo>,
    shares: Vec<TodoShare>,
    last_created_at: Option<DateTime<Utc>>,
}

impl Tables {
    /// 共有行を結合した Todo を返す
    fn joined(&self, todo: &Todo) -> Todo {
        let mut shares: Vec<TodoShare> = self
            .shares
            .iter()
            .filter(|share| share.todo_id == todo.id)
            .cloned()
            .collect();
        shares.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let mut todo = todo.clone();
        todo.todo_shares = shares;
        todo
    }

    /// 作成日時が単調増加になるように採番する
    fn next_created_at(&mut self) -> DateTime<Utc> {
        let mut now = Utc::now();
        if let Some(last) = self.last_created_at {
            if now <= last {
                now = last + Duration::microseconds(1);
            }
        }
        self.last_created_at = Some(now);
        now
    }

    fn newest_first(&self, mut todos: Vec<Todo>) -> Vec<Todo> {
        todos.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        todos.iter().map(|todo| self.joined(todo)).collect()
    }
}

/// 単一の Mutex で全テーブルを保護するインメモリ実装（開発/テスト用）
///
/// ロックが 1 つなので共有と Todo の連鎖削除は原子的に行われる。
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    calls: Mutex<Vec<StoreCall>>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` の間はすべての操作が `StoreError::Unavailable` で失敗する
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// 採番を経由せずに行を投入する（共有行も含めて保存される）
    pub fn seed(&self, todo: Todo) {
        let mut tables = self.tables();
        for share in &todo.todo_shares {
            tables.shares.push(share.clone());
        }
        let mut row = todo;
        row.todo_shares = Vec::new();
        tables.todos.insert(row.id.clone(), row);
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        lock(&self.calls).clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    pub fn todo_count(&self) -> usize {
        self.tables().todos.len()
    }

    pub fn share_count(&self) -> usize {
        self.tables().shares.len()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        lock(&self.tables)
    }

    fn record(&self, call: StoreCall) -> Result<(), StoreError> {
        lock(&self.calls).push(call);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "in-memory store is offline".to_string(),
            ));
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl TodoStore for InMemoryStore {
    async fn select_todos(&self, filter: TodoFilter) -> Result<Vec<Todo>, StoreError> {
        self.record(StoreCall::SelectTodos(filter.clone()))?;
        let tables = self.tables();

        let rows = match filter {
            TodoFilter::Id(id) => tables
                .todos
                .get(&id)
                .map(|todo| vec![tables.joined(todo)])
                .unwrap_or_default(),
            TodoFilter::Owner(user_id) => {
                let owned = tables
                    .todos
                    .values()
                    .filter(|todo| todo.user_id == user_id)
                    .cloned()
                    .collect();
                tables.newest_first(owned)
            }
            TodoFilter::SharedWith(email) => {
                let shared = tables
                    .todos
                    .values()
                    .filter(|todo| {
                        tables
                            .shares
                            .iter()
                            .any(|s| s.todo_id == todo.id && s.shared_with_email == email)
                    })
                    .cloned()
                    .collect();
                tables.newest_first(shared)
            }
        };

        Ok(rows)
    }

    async fn select_share(
        &self,
        todo_id: &TodoId,
        email: &str,
    ) -> Result<Option<TodoShare>, StoreError> {
        self.record(StoreCall::SelectShare(todo_id.clone(), email.to_string()))?;
        let tables = self.tables();
        Ok(tables
            .shares
            .iter()
            .find(|s| &s.todo_id == todo_id && s.shared_with_email == email)
            .cloned())
    }

    async fn insert_todo(&self, todo: NewTodo) -> Result<Todo, StoreError> {
        self.record(StoreCall::InsertTodo)?;
        let mut tables = self.tables();
        let created_at = tables.next_created_at();
        let row = todo.into_todo(TodoId::new(), created_at);
        tables.todos.insert(row.id.clone(), row.clone());
        Ok(row)
    }

    async fn update_todo(&self, id: &TodoId, patch: TodoPatch) -> Result<(), StoreError> {
        self.record(StoreCall::UpdateTodo(id.clone()))?;
        if let Some(todo) = self.tables().todos.get_mut(id) {
            todo.apply(&patch);
        }
        Ok(())
    }

    async fn delete_todo(&self, id: &TodoId) -> Result<(), StoreError> {
        self.record(StoreCall::DeleteTodo(id.clone()))?;
        self.tables().todos.remove(id);
        Ok(())
    }

    async fn delete_shares(&self, todo_id: &TodoId) -> Result<(), StoreError> {
        self.record(StoreCall::DeleteShares(todo_id.clone()))?;
        self.tables().shares.retain(|s| &s.todo_id != todo_id);
        Ok(())
    }

    async fn delete_todo_with_shares(&self, id: &TodoId) -> Result<(), StoreError> {
        self.record(StoreCall::DeleteTodoWithShares(id.clone()))?;
        let mut tables = self.tables();
        tables.shares.retain(|s| &s.todo_id != id);
        tables.todos.remove(id);
        Ok(())
    }

    async fn insert_share(&self, share: TodoShare) -> Result<(), StoreError> {
        self.record(StoreCall::InsertShare(
            share.todo_id.clone(),
            share.shared_with_email.clone(),
        ))?;
        let mut tables = self.tables();
        let exists = tables.shares.iter().any(|s| {
            s.todo_id == share.todo_id && s.shared_with_email == share.shared_with_email
        });
        if exists {
            return Err(StoreError::Conflict(format!(
                "share ({}, {}) already exists",
                share.todo_id, share.shared_with_email
            )));
        }
        tables.shares.push(share);
        Ok(())
    }

    async fn update_share(
        &self,
        todo_id: &TodoId,
        email: &str,
        permission: Permission,
    ) -> Result<(), StoreError> {
        self.record(StoreCall::UpdateShare(todo_id.clone(), email.to_string()))?;
        let mut tables = self.tables();
        if let Some(share) = tables
            .shares
            .iter_mut()
            .find(|s| &s.todo_id == todo_id && s.shared_with_email == email)
        {
            share.permission = permission;
        }
        Ok(())
    }

    async fn delete_share(&self, todo_id: &TodoId, email: &str) -> Result<(), StoreError> {
        self.record(StoreCall::DeleteShare(todo_id.clone(), email.to_string()))?;
        self.tables()
            .shares
            .retain(|s| !(&s.todo_id == todo_id && s.shared_with_email == email));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::UserId;

    fn share(todo_id: &TodoId, email: &str) -> TodoShare {
        TodoShare {
            todo_id: todo_id.clone(),
            shared_with_email: email.to_string(),
            permission: Permission::ReadWrite,
            owner_email: "owner@x.com".to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_assigns_id_and_increasing_created_at() {
        let store = InMemoryStore::new();
        let owner = UserId::new();

        let first = store
            .insert_todo(NewTodo::new(owner.clone(), "A").unwrap())
            .await
            .unwrap();
        let second = store
            .insert_todo(NewTodo::new(owner.clone(), "B").unwrap())
            .await
            .unwrap();

        assert_ne!(first.id, second.id);
        assert!(second.created_at > first.created_at);
        assert_eq!(first.created_at, first.updated_at);
    }

    #[tokio::test]
    async fn owner_filter_returns_newest_first_with_shares() {
        let store = InMemoryStore::new();
        let owner = UserId::new();
        let older = store
            .insert_todo(NewTodo::new(owner.clone(), "older").unwrap())
            .await
            .unwrap();
        let newer = store
            .insert_todo(NewTodo::new(owner.clone(), "newer").unwrap())
            .await
            .unwrap();
        store.insert_share(share(&older.id, "b@x.com")).await.unwrap();

        let rows = store.select_todos(TodoFilter::Owner(owner)).await.unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, newer.id);
        assert_eq!(rows[1].id, older.id);
        assert_eq!(rows[1].todo_shares.len(), 1);
    }

    #[tokio::test]
    async fn shared_with_filter_matches_share_rows() {
        let store = InMemoryStore::new();
        let todo = store
            .insert_todo(NewTodo::new(UserId::new(), "shared").unwrap())
            .await
            .unwrap();
        store
            .insert_todo(NewTodo::new(UserId::new(), "private").unwrap())
            .await
            .unwrap();
        store.insert_share(share(&todo.id, "b@x.com")).await.unwrap();

        let rows = store
            .select_todos(TodoFilter::SharedWith("b@x.com".to_string()))
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, todo.id);
    }

    #[tokio::test]
    async fn duplicate_share_insert_conflicts() {
        let store = InMemoryStore::new();
        let id = TodoId::new();

        store.insert_share(share(&id, "b@x.com")).await.unwrap();
        let err = store.insert_share(share(&id, "b@x.com")).await.unwrap_err();

        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.share_count(), 1);
    }

    #[tokio::test]
    async fn cascade_delete_removes_todo_and_its_shares_only() {
        let store = InMemoryStore::new();
        let owner = UserId::new();
        let doomed = store
            .insert_todo(NewTodo::new(owner.clone(), "doomed").unwrap())
            .await
            .unwrap();
        let kept = store
            .insert_todo(NewTodo::new(owner, "kept").unwrap())
            .await
            .unwrap();
        store.insert_share(share(&doomed.id, "b@x.com")).await.unwrap();
        store.insert_share(share(&kept.id, "b@x.com")).await.unwrap();

        store.delete_todo_with_shares(&doomed.id).await.unwrap();

        assert_eq!(store.todo_count(), 1);
        assert_eq!(store.share_count(), 1);
        assert!(store
            .select_todos(TodoFilter::Id(doomed.id))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn update_of_missing_row_is_a_no_op() {
        let store = InMemoryStore::new();
        let patch = TodoPatch::completion(true, Utc::now());

        store.update_todo(&TodoId::new(), patch).await.unwrap();
        store
            .update_share(&TodoId::new(), "nobody@x.com", Permission::Read)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call_and_records_it() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);

        let err = store
            .select_todos(TodoFilter::Owner(UserId::new()))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(store.calls().len(), 1);
    }
}
