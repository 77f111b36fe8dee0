use crate::models::{
    assemble_todo, item_to_share, owner_pk, share_sk, share_to_item, shared_with_pk, todo_pk,
    todo_to_item, Item, OWNER_INDEX, SHARED_WITH_INDEX, SHARE_SK_PREFIX, TODO_SK,
};
use crate::store::{TodoFilter, TodoStore};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_dynamodb::error::DisplayErrorContext;
use aws_sdk_dynamodb::operation::query::builders::QueryFluentBuilder;
use aws_sdk_dynamodb::types::{AttributeValue, Delete, TransactWriteItem};
use aws_sdk_dynamodb::Client;
use chrono::Utc;
use domain::{NewTodo, Permission, StoreError, Todo, TodoId, TodoPatch, TodoShare};
use futures::future::try_join_all;
use shared::Config;
use tracing::{debug, info, warn};

/// TransactWriteItems の 1 リクエストあたりの上限
const MAX_TRANSACT_ITEMS: usize = 100;

/// DynamoDB（Single Table Design）をバックエンドとするストア
#[derive(Clone)]
pub struct DynamoDbStore {
    client: Client,
    table_name: String,
}

impl DynamoDbStore {
    pub async fn new(config: &Config) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.aws_region.clone()));
        if let Some(endpoint) = &config.dynamodb_endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let aws_config = loader.load().await;

        Self {
            client: Client::new(&aws_config),
            table_name: config.dynamodb_table.clone(),
        }
    }

    pub fn from_client(client: Client, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// ページングを辿ってクエリ結果をすべて取得する
    async fn query_all(&self, query: QueryFluentBuilder) -> Result<Vec<Item>, StoreError> {
        let mut items = Vec::new();
        let mut start_key = None;

        loop {
            let output = query
                .clone()
                .set_exclusive_start_key(start_key)
                .send()
                .await
                .map_err(query_error)?;
            items.extend(output.items().iter().cloned());

            match output.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
            }
        }

        Ok(items)
    }

    /// Todo 本体と共有行（同一パーティション）をまとめて取得
    async fn partition_items(&self, id: &TodoId) -> Result<Vec<Item>, StoreError> {
        let query = self
            .client
            .query()
            .table_name(&self.table_name)
            .key_condition_expression("PK = :pk")
            .expression_attribute_values(":pk", AttributeValue::S(todo_pk(id)))
            .consistent_read(true);
        self.query_all(query).await
    }

    async fn load_todo(&self, id: &TodoId) -> Result<Option<Todo>, StoreError> {
        let items = self.partition_items(id).await?;
        assemble_todo(&items)
    }

    /// パーティションを並行に読み込む。結果は `ids` の順序を保つ。
    async fn load_todos(&self, ids: Vec<TodoId>) -> Result<Vec<Todo>, StoreError> {
        let loaded = try_join_all(ids.iter().map(|id| self.load_todo(id))).await?;
        let todos = ids
            .iter()
            .zip(loaded)
            .filter_map(|(id, todo)| {
                if todo.is_none() {
                    warn!(todo_id = %id, "Index entry without todo item");
                }
                todo
            })
            .collect();
        Ok(todos)
    }

    async fn share_items(&self, todo_id: &TodoId) -> Result<Vec<Item>, StoreError> {
        let query = self
            .client
            .query()
            .table_name(&self.table_name)
            .key_condition_expression("PK = :pk AND begins_with(SK, :sk_prefix)")
            .expression_attribute_values(":pk", AttributeValue::S(todo_pk(todo_id)))
            .expression_attribute_values(
                ":sk_prefix",
                AttributeValue::S(SHARE_SK_PREFIX.to_string()),
            );
        self.query_all(query).await
    }

    async fn delete_key(&self, pk: String, sk: String) -> Result<(), StoreError> {
        self.client
            .delete_item()
            .table_name(&self.table_name)
            .key("PK", AttributeValue::S(pk))
            .key("SK", AttributeValue::S(sk))
            .send()
            .await
            .map_err(query_error)?;
        Ok(())
    }
}

fn query_error<E: std::error::Error>(err: E) -> StoreError {
    StoreError::Query(DisplayErrorContext(err).to_string())
}

fn string_attr(item: &Item, name: &str) -> Result<String, StoreError> {
    item.get(name)
        .and_then(|v| v.as_s().ok())
        .cloned()
        .ok_or_else(|| StoreError::Malformed(format!("missing attribute: {name}")))
}

#[async_trait]
impl TodoStore for DynamoDbStore {
    async fn select_todos(&self, filter: TodoFilter) -> Result<Vec<Todo>, StoreError> {
        match filter {
            TodoFilter::Id(id) => Ok(self.load_todo(&id).await?.into_iter().collect()),
            TodoFilter::Owner(user_id) => {
                let query = self
                    .client
                    .query()
                    .table_name(&self.table_name)
                    .index_name(OWNER_INDEX)
                    .key_condition_expression("GSI1PK = :pk")
                    .expression_attribute_values(":pk", AttributeValue::S(owner_pk(&user_id)))
                    .scan_index_forward(false);
                let ids = self
                    .query_all(query)
                    .await?
                    .iter()
                    .map(|item| string_attr(item, "id").map(TodoId::from_string))
                    .collect::<Result<Vec<_>, _>>()?;

                // インデックスの並び（created_at 降順）を維持する
                self.load_todos(ids).await
            }
            TodoFilter::SharedWith(email) => {
                let query = self
                    .client
                    .query()
                    .table_name(&self.table_name)
                    .index_name(SHARED_WITH_INDEX)
                    .key_condition_expression("GSI2PK = :pk")
                    .expression_attribute_values(":pk", AttributeValue::S(shared_with_pk(&email)));
                let ids = self
                    .query_all(query)
                    .await?
                    .iter()
                    .map(|item| string_attr(item, "todo_id").map(TodoId::from_string))
                    .collect::<Result<Vec<_>, _>>()?;

                let mut todos = self.load_todos(ids).await?;
                todos.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                Ok(todos)
            }
        }
    }

    async fn select_share(
        &self,
        todo_id: &TodoId,
        email: &str,
    ) -> Result<Option<TodoShare>, StoreError> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("PK", AttributeValue::S(todo_pk(todo_id)))
            .key("SK", AttributeValue::S(share_sk(email)))
            .consistent_read(true)
            .send()
            .await
            .map_err(query_error)?;

        output.item().map(item_to_share).transpose()
    }

    async fn insert_todo(&self, todo: NewTodo) -> Result<Todo, StoreError> {
        let todo = todo.into_todo(TodoId::new(), Utc::now());

        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(todo_to_item(&todo)))
            .condition_expression("attribute_not_exists(PK)")
            .send()
            .await
            .map_err(query_error)?;

        info!(todo_id = %todo.id, user_id = %todo.user_id, "Todo item saved");
        Ok(todo)
    }

    async fn update_todo(&self, id: &TodoId, patch: TodoPatch) -> Result<(), StoreError> {
        let mut set_parts = vec!["#updated_at = :updated_at"];
        let mut remove_parts = Vec::new();

        let mut builder = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key("PK", AttributeValue::S(todo_pk(id)))
            .key("SK", AttributeValue::S(TODO_SK.to_string()))
            .condition_expression("attribute_exists(PK)")
            .expression_attribute_names("#updated_at", "updated_at")
            .expression_attribute_values(
                ":updated_at",
                AttributeValue::S(patch.updated_at.to_rfc3339()),
            );

        if let Some(completed) = patch.completed {
            set_parts.push("#completed = :completed");
            builder = builder
                .expression_attribute_names("#completed", "completed")
                .expression_attribute_values(":completed", AttributeValue::Bool(completed));
        }

        match patch.due_date {
            Some(Some(due_date)) => {
                set_parts.push("#due_date = :due_date");
                builder = builder
                    .expression_attribute_names("#due_date", "due_date")
                    .expression_attribute_values(
                        ":due_date",
                        AttributeValue::S(due_date.to_rfc3339()),
                    );
            }
            Some(None) => {
                remove_parts.push("#due_date");
                builder = builder.expression_attribute_names("#due_date", "due_date");
            }
            None => {}
        }

        let mut expression = format!("SET {}", set_parts.join(", "));
        if !remove_parts.is_empty() {
            expression.push_str(&format!(" REMOVE {}", remove_parts.join(", ")));
        }

        match builder.update_expression(expression).send().await {
            Ok(_) => Ok(()),
            // 対象行が無い更新はテーブルの意味論どおり何もしない
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_conditional_check_failed_exception()) =>
            {
                debug!(todo_id = %id, "Update matched no todo item");
                Ok(())
            }
            Err(err) => Err(query_error(err)),
        }
    }

    async fn delete_todo(&self, id: &TodoId) -> Result<(), StoreError> {
        self.delete_key(todo_pk(id), TODO_SK.to_string()).await
    }

    async fn delete_shares(&self, todo_id: &TodoId) -> Result<(), StoreError> {
        for item in self.share_items(todo_id).await? {
            self.delete_key(string_attr(&item, "PK")?, string_attr(&item, "SK")?)
                .await?;
        }
        Ok(())
    }

    async fn delete_todo_with_shares(&self, id: &TodoId) -> Result<(), StoreError> {
        let items = self.partition_items(id).await?;
        if items.is_empty() {
            return Ok(());
        }

        if items.len() > MAX_TRANSACT_ITEMS {
            warn!(
                todo_id = %id,
                item_count = items.len(),
                "Too many items for one transaction, deleting shares first"
            );
            self.delete_shares(id).await?;
            return self.delete_todo(id).await;
        }

        let mut request = self.client.transact_write_items();
        for item in &items {
            let delete = Delete::builder()
                .table_name(&self.table_name)
                .key("PK", AttributeValue::S(string_attr(item, "PK")?))
                .key("SK", AttributeValue::S(string_attr(item, "SK")?))
                .build()
                .map_err(|e| StoreError::Query(e.to_string()))?;
            request = request.transact_items(TransactWriteItem::builder().delete(delete).build());
        }
        request.send().await.map_err(query_error)?;

        info!(todo_id = %id, item_count = items.len(), "Todo and shares deleted");
        Ok(())
    }

    async fn insert_share(&self, share: TodoShare) -> Result<(), StoreError> {
        let result = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(share_to_item(&share)))
            .condition_expression("attribute_not_exists(PK)")
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_conditional_check_failed_exception()) =>
            {
                Err(StoreError::Conflict(format!(
                    "share ({}, {}) already exists",
                    share.todo_id, share.shared_with_email
                )))
            }
            Err(err) => Err(query_error(err)),
        }
    }

    async fn update_share(
        &self,
        todo_id: &TodoId,
        email: &str,
        permission: Permission,
    ) -> Result<(), StoreError> {
        let result = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key("PK", AttributeValue::S(todo_pk(todo_id)))
            .key("SK", AttributeValue::S(share_sk(email)))
            .update_expression("SET #permission = :permission")
            .condition_expression("attribute_exists(PK)")
            .expression_attribute_names("#permission", "permission")
            .expression_attribute_values(
                ":permission",
                AttributeValue::S(permission.as_str().to_string()),
            )
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_conditional_check_failed_exception()) =>
            {
                debug!(todo_id = %todo_id, email, "Permission update matched no share");
                Ok(())
            }
            Err(err) => Err(query_error(err)),
        }
    }

    async fn delete_share(&self, todo_id: &TodoId, email: &str) -> Result<(), StoreError> {
        self.delete_key(todo_pk(todo_id), share_sk(email)).await
    }
}
