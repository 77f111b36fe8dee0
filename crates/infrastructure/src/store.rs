use async_trait::async_trait;
use domain::{NewTodo, Permission, StoreError, Todo, TodoId, TodoPatch, TodoShare, UserId};

/// `todos` テーブルに対する絞り込み条件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TodoFilter {
    Id(TodoId),
    /// 所有者で絞り込み。`created_at` 降順で返す。
    Owner(UserId),
    /// 指定メールアドレスへの共有行を持つ Todo
    SharedWith(String),
}

/// バックエンドストアの最小抽象
///
/// 取得した Todo には常に共有行が結合される。
/// 一致する行が無い更新・削除はエラーにならない。
#[async_trait]
pub trait TodoStore: Send + Sync {
    async fn select_todos(&self, filter: TodoFilter) -> Result<Vec<Todo>, StoreError>;

    async fn select_share(
        &self,
        todo_id: &TodoId,
        email: &str,
    ) -> Result<Option<TodoShare>, StoreError>;

    /// ID・作成日時はストアが採番する
    async fn insert_todo(&self, todo: NewTodo) -> Result<Todo, StoreError>;

    async fn update_todo(&self, id: &TodoId, patch: TodoPatch) -> Result<(), StoreError>;

    async fn delete_todo(&self, id: &TodoId) -> Result<(), StoreError>;

    async fn delete_shares(&self, todo_id: &TodoId) -> Result<(), StoreError>;

    /// 共有行を削除してから Todo を削除する。
    ///
    /// 既定実装はトランザクションを張らないため、2 段目で失敗すると
    /// 共有の無い Todo が残る。トランザクションを持つストアは上書きすること。
    async fn delete_todo_with_shares(&self, id: &TodoId) -> Result<(), StoreError> {
        self.delete_shares(id).await?;
        self.delete_todo(id).await
    }

    /// (todo_id, shared_with_email) が既に存在する場合は `StoreError::Conflict`
    async fn insert_share(&self, share: TodoShare) -> Result<(), StoreError>;

    async fn update_share(
        &self,
        todo_id: &TodoId,
        email: &str,
        permission: Permission,
    ) -> Result<(), StoreError>;

    async fn delete_share(&self, todo_id: &TodoId, email: &str) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryStore, StoreCall};
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// 連鎖削除を既定実装に任せるストア
    #[derive(Default)]
    struct TwoStepStore {
        inner: InMemoryStore,
        fail_todo_delete: AtomicBool,
    }

    #[async_trait]
    impl TodoStore for TwoStepStore {
        async fn select_todos(&self, filter: TodoFilter) -> Result<Vec<Todo>, StoreError> {
            self.inner.select_todos(filter).await
        }

        async fn select_share(
            &self,
            todo_id: &TodoId,
            email: &str,
        ) -> Result<Option<TodoShare>, StoreError> {
            self.inner.select_share(todo_id, email).await
        }

        async fn insert_todo(&self, todo: NewTodo) -> Result<Todo, StoreError> {
            self.inner.insert_todo(todo).await
        }

        async fn update_todo(&self, id: &TodoId, patch: TodoPatch) -> Result<(), StoreError> {
            self.inner.update_todo(id, patch).await
        }

        async fn delete_todo(&self, id: &TodoId) -> Result<(), StoreError> {
            if self.fail_todo_delete.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("connection reset".to_string()));
            }
            self.inner.delete_todo(id).await
        }

        async fn delete_shares(&self, todo_id: &TodoId) -> Result<(), StoreError> {
            self.inner.delete_shares(todo_id).await
        }

        async fn insert_share(&self, share: TodoShare) -> Result<(), StoreError> {
            self.inner.insert_share(share).await
        }

        async fn update_share(
            &self,
            todo_id: &TodoId,
            email: &str,
            permission: Permission,
        ) -> Result<(), StoreError> {
            self.inner.update_share(todo_id, email, permission).await
        }

        async fn delete_share(&self, todo_id: &TodoId, email: &str) -> Result<(), StoreError> {
            self.inner.delete_share(todo_id, email).await
        }
    }

    async fn shared_todo(store: &TwoStepStore) -> Todo {
        let todo = store
            .insert_todo(NewTodo::new(UserId::new(), "task").unwrap())
            .await
            .unwrap();
        store
            .insert_share(TodoShare {
                todo_id: todo.id.clone(),
                shared_with_email: "b@x.com".to_string(),
                permission: Permission::ReadWrite,
                owner_email: "a@x.com".to_string(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        store.inner.clear_calls();
        todo
    }

    #[tokio::test]
    async fn default_cascade_deletes_shares_before_todo() {
        let store = TwoStepStore::default();
        let todo = shared_todo(&store).await;

        store.delete_todo_with_shares(&todo.id).await.unwrap();

        assert_eq!(
            store.inner.calls(),
            vec![
                StoreCall::DeleteShares(todo.id.clone()),
                StoreCall::DeleteTodo(todo.id.clone()),
            ]
        );
        assert_eq!(store.inner.todo_count(), 0);
        assert_eq!(store.inner.share_count(), 0);
    }

    #[tokio::test]
    async fn default_cascade_failing_second_step_leaves_unshared_todo() {
        // Arrange: Todo 本体の削除だけ失敗させる
        let store = TwoStepStore::default();
        let todo = shared_todo(&store).await;
        store.fail_todo_delete.store(true, Ordering::SeqCst);

        // Act
        let result = store.delete_todo_with_shares(&todo.id).await;

        // Assert: 共有行だけ消えた Todo が残る
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(
            store.inner.calls(),
            vec![StoreCall::DeleteShares(todo.id.clone())]
        );
        let rows = store
            .inner
            .select_todos(TodoFilter::Id(todo.id.clone()))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].todo_shares.is_empty());
    }
}
