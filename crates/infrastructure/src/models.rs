use aws_sdk_dynamodb::types::AttributeValue;
use chrono::{DateTime, SecondsFormat, Utc};
use domain::{Permission, StoreError, Todo, TodoId, TodoShare, UserId};
use std::collections::HashMap;

pub type Item = HashMap<String, AttributeValue>;

pub const TODO_SK: &str = "TODO";
pub const SHARE_SK_PREFIX: &str = "SHARE#";
/// 所有者ごとの一覧（作成日時でソート）
pub const OWNER_INDEX: &str = "GSI1";
/// 共有先メールアドレスごとの一覧
pub const SHARED_WITH_INDEX: &str = "GSI2";

/// DynamoDB アイテムのエンティティタイプ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityType {
    Todo,
    Share,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Todo => "Todo",
            EntityType::Share => "Share",
        }
    }

    pub fn of(item: &Item) -> Option<Self> {
        match item.get("EntityType").and_then(|v| v.as_s().ok())?.as_str() {
            "Todo" => Some(EntityType::Todo),
            "Share" => Some(EntityType::Share),
            _ => None,
        }
    }
}

/// Single Table Design のキー構造
///
/// Todo とその共有行は同じパーティション（`TODO#<id>`）に置く。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamoDbKeys {
    pub pk: String,
    pub sk: String,
    pub gsi_pk: String,
    pub gsi_sk: String,
}

impl DynamoDbKeys {
    pub fn for_todo(todo: &Todo) -> Self {
        Self {
            pk: todo_pk(&todo.id),
            sk: TODO_SK.to_string(),
            gsi_pk: owner_pk(&todo.user_id),
            // 固定桁にして文字列順 = 時刻順にする
            gsi_sk: todo.created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
        }
    }

    pub fn for_share(share: &TodoShare) -> Self {
        Self {
            pk: todo_pk(&share.todo_id),
            sk: share_sk(&share.shared_with_email),
            gsi_pk: shared_with_pk(&share.shared_with_email),
            gsi_sk: share.todo_id.as_str().to_string(),
        }
    }
}

pub fn todo_pk(id: &TodoId) -> String {
    format!("TODO#{}", id.as_str())
}

pub fn share_sk(email: &str) -> String {
    format!("{SHARE_SK_PREFIX}{email}")
}

pub fn owner_pk(user_id: &UserId) -> String {
    format!("USER#{}", user_id.as_str())
}

pub fn shared_with_pk(email: &str) -> String {
    format!("SHARED#{email}")
}

pub fn todo_to_item(todo: &Todo) -> Item {
    let keys = DynamoDbKeys::for_todo(todo);
    let mut item = HashMap::new();

    item.insert("PK".to_string(), AttributeValue::S(keys.pk));
    item.insert("SK".to_string(), AttributeValue::S(keys.sk));
    item.insert("GSI1PK".to_string(), AttributeValue::S(keys.gsi_pk));
    item.insert("GSI1SK".to_string(), AttributeValue::S(keys.gsi_sk));
    item.insert(
        "EntityType".to_string(),
        AttributeValue::S(EntityType::Todo.as_str().to_string()),
    );
    item.insert("id".to_string(), AttributeValue::S(todo.id.as_str().to_string()));
    item.insert(
        "user_id".to_string(),
        AttributeValue::S(todo.user_id.as_str().to_string()),
    );
    item.insert("content".to_string(), AttributeValue::S(todo.content.clone()));
    if let Some(description) = &todo.description {
        item.insert("description".to_string(), AttributeValue::S(description.clone()));
    }
    if let Some(due_date) = todo.due_date {
        item.insert("due_date".to_string(), AttributeValue::S(due_date.to_rfc3339()));
    }
    item.insert("completed".to_string(), AttributeValue::Bool(todo.completed));
    item.insert(
        "created_at".to_string(),
        AttributeValue::S(todo.created_at.to_rfc3339()),
    );
    item.insert(
        "updated_at".to_string(),
        AttributeValue::S(todo.updated_at.to_rfc3339()),
    );

    item
}

pub fn share_to_item(share: &TodoShare) -> Item {
    let keys = DynamoDbKeys::for_share(share);
    let mut item = HashMap::new();

    item.insert("PK".to_string(), AttributeValue::S(keys.pk));
    item.insert("SK".to_string(), AttributeValue::S(keys.sk));
    item.insert("GSI2PK".to_string(), AttributeValue::S(keys.gsi_pk));
    item.insert("GSI2SK".to_string(), AttributeValue::S(keys.gsi_sk));
    item.insert(
        "EntityType".to_string(),
        AttributeValue::S(EntityType::Share.as_str().to_string()),
    );
    item.insert(
        "todo_id".to_string(),
        AttributeValue::S(share.todo_id.as_str().to_string()),
    );
    item.insert(
        "shared_with_email".to_string(),
        AttributeValue::S(share.shared_with_email.clone()),
    );
    item.insert(
        "permission".to_string(),
        AttributeValue::S(share.permission.as_str().to_string()),
    );
    item.insert(
        "owner_email".to_string(),
        AttributeValue::S(share.owner_email.clone()),
    );
    item.insert(
        "created_at".to_string(),
        AttributeValue::S(share.created_at.to_rfc3339()),
    );

    item
}

/// 共有行は結合されない（`todo_shares` は空）
pub fn item_to_todo(item: &Item) -> Result<Todo, StoreError> {
    Ok(Todo {
        id: TodoId::from_string(get_s(item, "id")?.clone()),
        user_id: UserId::from_string(get_s(item, "user_id")?.clone()),
        content: get_s(item, "content")?.clone(),
        description: get_opt_s(item, "description").cloned(),
        due_date: get_opt_s(item, "due_date").map(|s| parse_time("due_date", s)).transpose()?,
        completed: *item
            .get("completed")
            .and_then(|v| v.as_bool().ok())
            .ok_or_else(|| StoreError::Malformed("missing attribute: completed".to_string()))?,
        created_at: parse_time("created_at", get_s(item, "created_at")?)?,
        updated_at: parse_time("updated_at", get_s(item, "updated_at")?)?,
        todo_shares: Vec::new(),
    })
}

pub fn item_to_share(item: &Item) -> Result<TodoShare, StoreError> {
    let permission = get_s(item, "permission")?
        .parse::<Permission>()
        .map_err(|e| StoreError::Malformed(e.to_string()))?;

    Ok(TodoShare {
        todo_id: TodoId::from_string(get_s(item, "todo_id")?.clone()),
        shared_with_email: get_s(item, "shared_with_email")?.clone(),
        permission,
        owner_email: get_s(item, "owner_email")?.clone(),
        created_at: parse_time("created_at", get_s(item, "created_at")?)?,
    })
}

/// 同一パーティションのアイテム群から共有行付きの Todo を組み立てる
pub fn assemble_todo(items: &[Item]) -> Result<Option<Todo>, StoreError> {
    let mut todo = None;
    let mut shares = Vec::new();

    for item in items {
        match EntityType::of(item) {
            Some(EntityType::Todo) => todo = Some(item_to_todo(item)?),
            Some(EntityType::Share) => shares.push(item_to_share(item)?),
            None => {
                return Err(StoreError::Malformed(
                    "item without a known EntityType".to_string(),
                ))
            }
        }
    }

    Ok(todo.map(|mut todo| {
        shares.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        todo.todo_shares = shares;
        todo
    }))
}

fn get_s<'a>(item: &'a Item, name: &str) -> Result<&'a String, StoreError> {
    get_opt_s(item, name).ok_or_else(|| StoreError::Malformed(format!("missing attribute: {name}")))
}

fn get_opt_s<'a>(item: &'a Item, name: &str) -> Option<&'a String> {
    item.get(name).and_then(|v| v.as_s().ok())
}

fn parse_time(name: &str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Malformed(format!("invalid {name}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn todo() -> Todo {
        let at = Utc.with_ymd_and_hms(2025, 1, 5, 9, 0, 0).unwrap();
        Todo {
            id: TodoId::from_string("01JH0000000000000000000000"),
            user_id: UserId::from_string("user-1"),
            content: "Buy milk".to_string(),
            description: None,
            due_date: Some(at),
            completed: false,
            created_at: at,
            updated_at: at,
            todo_shares: Vec::new(),
        }
    }

    fn share(todo: &Todo) -> TodoShare {
        TodoShare {
            todo_id: todo.id.clone(),
            shared_with_email: "b@x.com".to_string(),
            permission: Permission::Read,
            owner_email: "a@x.com".to_string(),
            created_at: todo.created_at,
        }
    }

    #[test]
    fn todo_item_carries_table_and_index_keys() {
        let item = todo_to_item(&todo());

        assert_eq!(item["PK"], AttributeValue::S("TODO#01JH0000000000000000000000".into()));
        assert_eq!(item["SK"], AttributeValue::S("TODO".into()));
        assert_eq!(item["GSI1PK"], AttributeValue::S("USER#user-1".into()));
        assert!(!item.contains_key("description"));
    }

    #[test]
    fn share_item_is_indexed_by_email() {
        let todo = todo();
        let item = share_to_item(&share(&todo));

        assert_eq!(item["PK"], AttributeValue::S(todo_pk(&todo.id)));
        assert_eq!(item["SK"], AttributeValue::S("SHARE#b@x.com".into()));
        assert_eq!(item["GSI2PK"], AttributeValue::S("SHARED#b@x.com".into()));
    }

    #[test]
    fn assemble_joins_shares_onto_todo() {
        let todo = todo();
        let items = vec![share_to_item(&share(&todo)), todo_to_item(&todo)];

        let assembled = assemble_todo(&items).unwrap().unwrap();

        assert_eq!(assembled.id, todo.id);
        assert_eq!(assembled.due_date, todo.due_date);
        assert_eq!(assembled.todo_shares, vec![share(&todo)]);
    }

    #[test]
    fn assemble_without_todo_item_is_none() {
        let todo = todo();
        let items = vec![share_to_item(&share(&todo))];
        assert_eq!(assemble_todo(&items).unwrap(), None);
    }

    #[test]
    fn missing_attribute_is_malformed() {
        let mut item = todo_to_item(&todo());
        item.remove("content");
        assert!(matches!(item_to_todo(&item), Err(StoreError::Malformed(_))));
    }
}
