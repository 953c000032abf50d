use crate::ports::table_store::{
    ChangeEvent, ChangeKind, Filter, Query, Record, Result, StoreError, Table,
    TableStore as TableStoreTrait, value_text,
};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use sqlx::postgres::PgListener;
use sqlx::{PgPool, Row};

/// 変更通知のチャンネル（マイグレーションのトリガーが送信する）
pub const CHANGE_CHANNEL: &str = "lending_changes";

/// 存在しない列（PostgreSQLのエラーコード）
const UNDEFINED_COLUMN: &str = "42703";

/// バインドするパラメータ
#[derive(Debug, Clone, PartialEq)]
enum Param {
    Text(String),
    Json(Value),
}

/// 組み立て済みのSQL文
#[derive(Debug, Clone, PartialEq)]
struct Statement {
    sql: String,
    params: Vec<Param>,
}

impl Statement {
    fn new() -> Self {
        Self {
            sql: String::new(),
            params: Vec::new(),
        }
    }

    /// パラメータを追加し、プレースホルダーを返す
    fn bind(&mut self, param: Param) -> String {
        self.params.push(param);
        format!("${}", self.params.len())
    }
}

/// 列名を検証する
///
/// 列名はSQLに直接埋め込むため、小文字の英数字とアンダースコアのみ許可する。
/// 許可しない名前は存在しない列として扱う。
fn column(table: Table, name: &str) -> Result<String> {
    let valid = !name.is_empty()
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !valid {
        return Err(StoreError::MissingColumn {
            table: table.as_str().to_string(),
            column: name.to_string(),
        });
    }
    Ok(name.to_string())
}

/// 絞り込み条件をSQLに変換する
///
/// 値はすべて文字列表現で比較する（`t.col::text = $n`）。NULLとの比較は常に偽。
fn filter_sql(statement: &mut Statement, table: Table, filter: &Filter) -> Result<String> {
    match filter {
        Filter::Eq { column: name, value } => {
            let name = column(table, name)?;
            match value_text(value) {
                Some(text) => {
                    let placeholder = statement.bind(Param::Text(text));
                    Ok(format!("t.{}::text = {}", name, placeholder))
                }
                None => Ok("FALSE".to_string()),
            }
        }
        Filter::Or(filters) => {
            if filters.is_empty() {
                return Ok("FALSE".to_string());
            }
            let parts = filters
                .iter()
                .map(|f| filter_sql(statement, table, f))
                .collect::<Result<Vec<_>>>()?;
            Ok(format!("({})", parts.join(" OR ")))
        }
    }
}

fn select_statement(table: Table, query: &Query) -> Result<Statement> {
    let mut statement = Statement::new();
    let mut sql = format!("SELECT to_jsonb(t) AS row FROM {} AS t", table.as_str());
    if let Some(filter) = &query.filter {
        let condition = filter_sql(&mut statement, table, filter)?;
        sql.push_str(&format!(" WHERE {}", condition));
    }
    if let Some(order) = &query.order {
        let name = column(table, &order.column)?;
        let direction = if order.ascending { "ASC" } else { "DESC" };
        sql.push_str(&format!(" ORDER BY t.{} {} NULLS LAST", name, direction));
    }
    if let Some(limit) = query.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }
    statement.sql = sql;
    Ok(statement)
}

/// 挿入文
///
/// 行のJSONを `jsonb_populate_record` で列の型に変換する。
/// 指定されなかった列はテーブルの既定値になる。
fn insert_statement(table: Table, record: &Record) -> Result<Statement> {
    let mut statement = Statement::new();
    let name = table.as_str();
    if record.is_empty() {
        statement.sql = format!(
            "INSERT INTO {} AS t DEFAULT VALUES RETURNING to_jsonb(t) AS row",
            name
        );
        return Ok(statement);
    }

    let columns = record
        .keys()
        .map(|key| column(table, key))
        .collect::<Result<Vec<_>>>()?
        .join(", ");
    let placeholder = statement.bind(Param::Json(Value::Object(record.clone())));
    statement.sql = format!(
        "INSERT INTO {name} AS t ({columns}) \
         SELECT {columns} FROM jsonb_populate_record(NULL::{name}, {placeholder}::jsonb) \
         RETURNING to_jsonb(t) AS row"
    );
    Ok(statement)
}

/// 更新文
///
/// `limit` を指定した場合は一致する行のうちその件数だけを更新する。
fn update_statement(
    table: Table,
    filter: &Filter,
    changes: &Record,
    limit: Option<usize>,
) -> Result<Statement> {
    if changes.is_empty() {
        return Err(StoreError::backend("update without changes"));
    }

    let mut statement = Statement::new();
    let name = table.as_str();
    let assignments = changes
        .keys()
        .map(|key| column(table, key).map(|c| format!("{c} = p.{c}")))
        .collect::<Result<Vec<_>>>()?
        .join(", ");
    let placeholder = statement.bind(Param::Json(Value::Object(changes.clone())));
    let condition = filter_sql(&mut statement, table, filter)?;

    let target = match limit {
        Some(limit) => format!(
            "t.ctid IN (SELECT t.ctid FROM {name} AS t WHERE {condition} LIMIT {limit})"
        ),
        None => condition,
    };
    statement.sql = format!(
        "UPDATE {name} AS t SET {assignments} \
         FROM jsonb_populate_record(NULL::{name}, {placeholder}::jsonb) AS p \
         WHERE {target} \
         RETURNING to_jsonb(t) AS row"
    );
    Ok(statement)
}

fn delete_statement(table: Table, filter: &Filter) -> Result<Statement> {
    let mut statement = Statement::new();
    let condition = filter_sql(&mut statement, table, filter)?;
    statement.sql = format!("DELETE FROM {} AS t WHERE {}", table.as_str(), condition);
    Ok(statement)
}

/// エラーメッセージから列名を取り出す（`column "x" does not exist`）
fn missing_column_name(message: &str) -> Option<String> {
    let start = message.find('"')? + 1;
    let end = start + message[start..].find('"')?;
    let quoted = &message[start..end];
    // `t.col` の形式で返ることがある
    Some(quoted.rsplit('.').next().unwrap_or(quoted).to_string())
}

fn map_error(table: Table, error: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &error {
        if db.code().as_deref() == Some(UNDEFINED_COLUMN) {
            return StoreError::MissingColumn {
                table: table.as_str().to_string(),
                column: missing_column_name(db.message()).unwrap_or_default(),
            };
        }
    }
    StoreError::backend(error)
}

/// トリガーが送信する変更通知
///
/// `old`・`new` はキー列と参加者の列だけを持つ（NOTIFYの上限は8000バイト）。
#[derive(Debug, Deserialize)]
struct ChangePayload {
    table: String,
    #[serde(rename = "type")]
    kind: String,
    old: Option<Record>,
    new: Option<Record>,
}

fn parse_change(payload: &str) -> Option<ChangeEvent> {
    let parsed: ChangePayload = match serde_json::from_str(payload) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring malformed change notification");
            return None;
        }
    };
    Some(ChangeEvent {
        table: parsed.table.parse().ok()?,
        kind: parsed.kind.parse().ok()?,
        old: parsed.old,
        new: parsed.new,
    })
}

/// TableStoreのPostgreSQL実装
///
/// 行は `to_jsonb` でJSONとして読み書きする。
/// 変更通知は `LISTEN lending_changes` で受け取る。
pub struct TableStore {
    pool: PgPool,
}

impl TableStore {
    /// PostgreSQLコネクションプールから新しいTableStoreを作成
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_rows(&self, table: Table, statement: Statement) -> Result<Vec<Record>> {
        fetch_rows(&self.pool, table, statement).await
    }
}

async fn fetch_rows(pool: &PgPool, table: Table, statement: Statement) -> Result<Vec<Record>> {
    let Statement { sql, params } = statement;
    let mut query = sqlx::query(&sql);
    for param in params {
        query = match param {
            Param::Text(text) => query.bind(text),
            Param::Json(json) => query.bind(json),
        };
    }

    let rows = query
        .fetch_all(pool)
        .await
        .map_err(|e| map_error(table, e))?;

    rows.iter()
        .map(|row| {
            let value: Value = row.try_get("row").map_err(StoreError::backend)?;
            match value {
                Value::Object(record) => Ok(record),
                other => Err(StoreError::backend(format!(
                    "unexpected row shape from {}: {}",
                    table.as_str(),
                    other
                ))),
            }
        })
        .collect()
}

/// 通知に含まれたキーから完全な行を読み直すクエリ
fn refetch_statement(table: Table, keys: &Record) -> Option<Statement> {
    let id = keys.get("id").filter(|id| !id.is_null())?;
    let query = Query::new().filter(Filter::eq("id", id.clone())).limit(1);
    select_statement(table, &query).ok()
}

/// 挿入・更新の通知を完全な行で置き換える
///
/// 削除の通知はキーだけで十分なのでそのまま返す。
/// 行がすでに消えていれば通知を捨てる（続く削除通知で反映される）。
async fn hydrate(pool: &PgPool, mut event: ChangeEvent) -> Option<ChangeEvent> {
    if event.kind == ChangeKind::Delete {
        return Some(event);
    }
    let statement = event
        .new
        .as_ref()
        .and_then(|keys| refetch_statement(event.table, keys))?;
    match fetch_rows(pool, event.table, statement).await {
        Ok(rows) => {
            event.new = Some(rows.into_iter().next()?);
            Some(event)
        }
        Err(e) => {
            tracing::warn!(table = event.table.as_str(), error = %e, "Failed to load changed row");
            None
        }
    }
}

#[async_trait]
impl TableStoreTrait for TableStore {
    async fn select(&self, table: Table, query: Query) -> Result<Vec<Record>> {
        let statement = select_statement(table, &query)?;
        self.fetch_rows(table, statement).await
    }

    async fn insert(&self, table: Table, record: Record) -> Result<Record> {
        let statement = insert_statement(table, &record)?;
        self.fetch_rows(table, statement)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::backend(format!("insert into {} returned no row", table.as_str())))
    }

    async fn update(
        &self,
        table: Table,
        filter: Filter,
        changes: Record,
        limit: Option<usize>,
    ) -> Result<Vec<Record>> {
        let statement = update_statement(table, &filter, &changes, limit)?;
        self.fetch_rows(table, statement).await
    }

    async fn delete(&self, table: Table, filter: Filter) -> Result<u64> {
        let Statement { sql, params } = delete_statement(table, &filter)?;
        let mut query = sqlx::query(&sql);
        for param in params {
            query = match param {
                Param::Text(text) => query.bind(text),
                Param::Json(json) => query.bind(json),
            };
        }
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| map_error(table, e))?;
        Ok(result.rows_affected())
    }

    /// 変更通知を購読する
    ///
    /// 接続が切れたらストリームは終了する。
    async fn subscribe(
        &self,
        table: Table,
        filter: Option<Filter>,
    ) -> Result<BoxStream<'static, ChangeEvent>> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        listener
            .listen(CHANGE_CHANNEL)
            .await
            .map_err(StoreError::backend)?;

        // 絞り込みは読み直す前にキー列で行う
        let pool = self.pool.clone();
        let stream = futures::stream::unfold(listener, move |mut listener| {
            let pool = pool.clone();
            let filter = filter.clone();
            async move {
                loop {
                    let notification = match listener.recv().await {
                        Ok(notification) => notification,
                        Err(e) => {
                            tracing::error!(error = %e, "Change listener disconnected");
                            return None;
                        }
                    };
                    let Some(event) = parse_change(notification.payload()) else {
                        continue;
                    };
                    let wanted = event.table == table
                        && filter.as_ref().is_none_or(|filter| event.matches(filter));
                    if !wanted {
                        continue;
                    }
                    if let Some(event) = hydrate(&pool, event).await {
                        return Some((event, listener));
                    }
                }
            }
        });

        Ok(stream.boxed())
    }
}
