use crate::due_date::{self, DueStatus};
use crate::errors::TodoError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Todo の識別子（ULID）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TodoId(String);

impl TodoId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// ストアやパスから受け取った文字列をそのまま ID として扱う
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn timestamp_ms(&self) -> Option<u64> {
        ulid::Ulid::from_string(&self.0)
            .ok()
            .map(|ulid| ulid.timestamp_ms())
    }
}

impl Default for TodoId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TodoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 認証プロバイダが払い出すユーザーID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 共有先に与える権限
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    ReadWrite,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::ReadWrite => "read_write",
        }
    }

    pub fn can_write(&self) -> bool {
        matches!(self, Permission::ReadWrite)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = TodoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Permission::Read),
            "read_write" => Ok(Permission::ReadWrite),
            other => Err(TodoError::Validation(format!(
                "Unknown permission: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoShare {
    pub todo_id: TodoId,
    pub shared_with_email: String,
    pub permission: Permission,
    /// 所有者のメールアドレス（非正規化コピー）
    pub owner_email: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Todo {
    pub id: TodoId,
    pub user_id: UserId,
    pub content: String,
    pub description: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub todo_shares: Vec<TodoShare>,
}

impl Todo {
    pub fn is_owned_by(&self, user_id: &UserId) -> bool {
        &self.user_id == user_id
    }

    pub fn share_for(&self, email: &str) -> Option<&TodoShare> {
        self.todo_shares
            .iter()
            .find(|share| share.shared_with_email == email)
    }

    /// 期限の状態。期限が無ければ `None`
    pub fn due_status(&self, now: DateTime<Utc>) -> Option<DueStatus> {
        self.due_date.map(|due| due_date::classify(due, now))
    }

    /// 更新パッチを適用する。所有者と作成日時は変更しない。
    pub fn apply(&mut self, patch: &TodoPatch) {
        if let Some(completed) = patch.completed {
            self.completed = completed;
        }
        if let Some(due_date) = patch.due_date {
            self.due_date = due_date;
        }
        self.updated_at = patch.updated_at;
    }
}

/// Todo 作成時の入力。ID と作成日時はストアが採番する。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTodo {
    pub user_id: UserId,
    pub content: String,
    pub description: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub completed: bool,
}

impl NewTodo {
    pub fn new(user_id: UserId, content: &str) -> Result<Self, TodoError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(TodoError::Validation(
                "Todo content cannot be empty".to_string(),
            ));
        }

        Ok(Self {
            user_id,
            content: content.to_string(),
            description: None,
            due_date: None,
            completed: false,
        })
    }

    /// 空白のみの説明は `None` として扱う
    pub fn with_description(mut self, description: Option<&str>) -> Self {
        self.description = description
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string);
        self
    }

    pub fn with_due_date(mut self, due_date: Option<DateTime<Utc>>) -> Self {
        self.due_date = due_date;
        self
    }

    /// ストアが採番した値で `Todo` を組み立てる
    pub fn into_todo(self, id: TodoId, created_at: DateTime<Utc>) -> Todo {
        Todo {
            id,
            user_id: self.user_id,
            content: self.content,
            description: self.description,
            due_date: self.due_date,
            completed: self.completed,
            created_at,
            updated_at: created_at,
            todo_shares: Vec::new(),
        }
    }
}

/// 部分更新。`due_date: Some(None)` は期限のクリアを表す。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TodoPatch {
    pub completed: Option<bool>,
    pub due_date: Option<Option<DateTime<Utc>>>,
    pub updated_at: DateTime<Utc>,
}

impl TodoPatch {
    pub fn completion(completed: bool, now: DateTime<Utc>) -> Self {
        Self {
            completed: Some(completed),
            due_date: None,
            updated_at: now,
        }
    }

    pub fn due_date(due_date: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        Self {
            completed: None,
            due_date: Some(due_date),
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn sample_todo() -> Todo {
        let created_at = Utc.with_ymd_and_hms(2025, 1, 5, 9, 0, 0).unwrap();
        NewTodo::new(UserId::from_string("owner-1"), "Buy milk")
            .unwrap()
            .into_todo(TodoId::new(), created_at)
    }

    #[test]
    fn test_todo_id_new_generates_26_char_string() {
        // Act: 新しいTodoIdを生成
        let todo_id = TodoId::new();

        // Assert: 26文字のBase32形式であることを確認
        assert_eq!(todo_id.as_str().len(), 26);
        assert!(todo_id.timestamp_ms().is_some());
    }

    #[test]
    fn new_todo_trims_content_and_rejects_blank() {
        let todo = NewTodo::new(UserId::new(), "  Buy milk  ").unwrap();
        assert_eq!(todo.content, "Buy milk");
        assert!(!todo.completed);

        let err = NewTodo::new(UserId::new(), "   ").unwrap_err();
        assert!(matches!(err, TodoError::Validation(_)));
    }

    #[test]
    fn blank_description_becomes_none() {
        let todo = NewTodo::new(UserId::new(), "Task")
            .unwrap()
            .with_description(Some("   "));
        assert_eq!(todo.description, None);

        let todo = todo.with_description(Some(" details "));
        assert_eq!(todo.description.as_deref(), Some("details"));
    }

    #[test]
    fn permission_round_trips_through_wire_names() {
        assert_eq!("read".parse::<Permission>().unwrap(), Permission::Read);
        assert_eq!(
            "read_write".parse::<Permission>().unwrap(),
            Permission::ReadWrite
        );
        assert!("admin".parse::<Permission>().is_err());
        assert_eq!(
            serde_json::to_string(&Permission::ReadWrite).unwrap(),
            "\"read_write\""
        );
    }

    #[test]
    fn apply_patch_keeps_owner_and_created_at() {
        let mut todo = sample_todo();
        let owner = todo.user_id.clone();
        let created_at = todo.created_at;
        let now = created_at + Duration::hours(1);

        todo.apply(&TodoPatch::completion(true, now));
        assert!(todo.completed);
        assert_eq!(todo.updated_at, now);

        let due = now + Duration::days(2);
        todo.apply(&TodoPatch::due_date(Some(due), now));
        assert_eq!(todo.due_date, Some(due));
        assert!(todo.completed);

        todo.apply(&TodoPatch::due_date(None, now));
        assert_eq!(todo.due_date, None);

        assert_eq!(todo.user_id, owner);
        assert_eq!(todo.created_at, created_at);
    }

    #[test]
    fn due_status_is_none_without_due_date() {
        let todo = sample_todo();
        assert_eq!(todo.due_status(Utc::now()), None);
    }

    #[test]
    fn share_for_finds_matching_email() {
        let mut todo = sample_todo();
        todo.todo_shares.push(TodoShare {
            todo_id: todo.id.clone(),
            shared_with_email: "b@x.com".to_string(),
            permission: Permission::ReadWrite,
            owner_email: "a@x.com".to_string(),
            created_at: todo.created_at,
        });

        assert!(todo.share_for("b@x.com").is_some());
        assert!(todo.share_for("c@x.com").is_none());
    }
}
