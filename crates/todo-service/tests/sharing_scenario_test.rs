use domain::{NewTodo, Permission, TodoError, UserId};
use infrastructure::InMemoryStore;
use shared::{Session, SessionContext};
use std::sync::Arc;
use todo_service::TodoService;

#[tokio::test]
async fn owner_shares_changes_permission_and_unshares() {
    let service = TodoService::new(Arc::new(InMemoryStore::new()));
    let owner = UserId::new();
    let session = SessionContext::authenticated(Session::new(owner.clone(), "a@x.com"));

    // 作成
    let todo = service
        .create_todo(NewTodo::new(owner.clone(), "Buy milk").unwrap())
        .await
        .unwrap();
    assert!(!todo.id.as_str().is_empty());
    assert!(!todo.completed);
    assert!(todo.todo_shares.is_empty());

    // 共有すると read_write で付与される
    service
        .share_todo(&session, &todo.id, "b@x.com")
        .await
        .unwrap();
    let shared = service.get_todo_by_id(&todo.id).await.unwrap();
    assert_eq!(shared.todo_shares.len(), 1);
    assert_eq!(shared.todo_shares[0].shared_with_email, "b@x.com");
    assert_eq!(shared.todo_shares[0].permission, Permission::ReadWrite);
    assert_eq!(shared.todo_shares[0].owner_email, "a@x.com");

    // 共有先からも一覧に見える
    let recipient = UserId::new();
    let visible = service
        .list_todos(&recipient, Some("b@x.com"))
        .await
        .unwrap();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].id, todo.id);

    // 権限変更
    service
        .update_share_permission(&todo.id, "b@x.com", Permission::Read)
        .await
        .unwrap();
    let downgraded = service.get_todo_by_id(&todo.id).await.unwrap();
    assert_eq!(downgraded.todo_shares[0].permission, Permission::Read);

    // 共有解除
    service.remove_share(&todo.id, "b@x.com").await.unwrap();
    let unshared = service.get_todo_by_id(&todo.id).await.unwrap();
    assert!(unshared.todo_shares.is_empty());

    // 削除後は取得できない
    service.delete_todo(&todo.id).await.unwrap();
    assert!(matches!(
        service.get_todo_by_id(&todo.id).await,
        Err(TodoError::NotFound(_))
    ));
}
