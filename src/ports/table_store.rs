use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::{Map, Value};
use thiserror::Error;

/// 永続化された1行（JSONオブジェクト）
pub type Record = Map<String, Value>;

pub type Result<T> = std::result::Result<T, StoreError>;

/// テーブル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Items,
    BorrowRequests,
    BorrowSchedules,
    Profiles,
}

impl Table {
    pub const ALL: [Table; 4] = [
        Table::Items,
        Table::BorrowRequests,
        Table::BorrowSchedules,
        Table::Profiles,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Items => "items",
            Table::BorrowRequests => "borrow_requests",
            Table::BorrowSchedules => "borrow_schedules",
            Table::Profiles => "profiles",
        }
    }
}

impl std::str::FromStr for Table {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Table::ALL
            .into_iter()
            .find(|table| table.as_str() == s)
            .ok_or_else(|| format!("Unknown table: {}", s))
    }
}

/// 行の絞り込み条件
///
/// 値の比較は文字列表現で行う（`42` と `"42"` は一致する）。
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq { column: String, value: Value },
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn or(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::Or(filters.into_iter().collect())
    }

    /// 行が条件に一致するか
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Filter::Eq { column, value } => match (record.get(column), value_text(value)) {
                (Some(actual), Some(expected)) => value_text(actual).as_deref() == Some(&expected),
                _ => false,
            },
            Filter::Or(filters) => filters.iter().any(|filter| filter.matches(record)),
        }
    }

    /// 条件が参照する列
    pub fn columns(&self) -> Vec<&str> {
        match self {
            Filter::Eq { column, .. } => vec![column.as_str()],
            Filter::Or(filters) => filters.iter().flat_map(Filter::columns).collect(),
        }
    }
}

/// 比較用の文字列表現（NULLは `None`）
pub fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

/// 検索条件
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filter: Option<Filter>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order = Some(Order {
            column: column.into(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl std::str::FromStr for ChangeKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "INSERT" => Ok(ChangeKind::Insert),
            "UPDATE" => Ok(ChangeKind::Update),
            "DELETE" => Ok(ChangeKind::Delete),
            _ => Err(format!("Unknown change kind: {}", s)),
        }
    }
}

/// 行の変更通知
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    /// 変更前の行（削除・更新時）
    pub old: Option<Record>,
    /// 変更後の行（挿入・更新時）
    pub new: Option<Record>,
}

impl ChangeEvent {
    /// 変更前後のいずれかの行が条件に一致するか
    pub fn matches(&self, filter: &Filter) -> bool {
        self.new.as_ref().is_some_and(|row| filter.matches(row))
            || self.old.as_ref().is_some_and(|row| filter.matches(row))
    }
}

/// テーブルストアのエラー
#[derive(Debug, Error)]
pub enum StoreError {
    /// 存在しない列を参照した（識別子の候補を切り替えて再試行できる）
    #[error("Column {column} does not exist on {table}")]
    MissingColumn { table: String, column: String },

    /// バックエンドのエラー
    #[error("Table store error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub fn backend(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        StoreError::Backend(error.into())
    }

    pub fn is_missing_column(&self) -> bool {
        matches!(self, StoreError::MissingColumn { .. })
    }
}

/// テーブルストアポート
///
/// 行単位の絞り込み・挿入・更新・削除と変更通知を持つ、単純なリレーショナルストアを抽象化する。
/// タイムアウトは実装側の責務。
#[async_trait]
pub trait TableStore: Send + Sync {
    /// 条件に一致する行を取得する
    async fn select(&self, table: Table, query: Query) -> Result<Vec<Record>>;

    /// 行を挿入し、保存された行を返す
    ///
    /// 既定値（ID、作成日時など）はストア側で補われる。
    async fn insert(&self, table: Table, record: Record) -> Result<Record>;

    /// 条件に一致する行を更新し、更新後の行を返す
    ///
    /// 一致する行がなければ空のVecを返す（エラーではない）。
    async fn update(
        &self,
        table: Table,
        filter: Filter,
        changes: Record,
        limit: Option<usize>,
    ) -> Result<Vec<Record>>;

    /// 条件に一致する行を削除し、削除件数を返す
    async fn delete(&self, table: Table, filter: Filter) -> Result<u64>;

    /// テーブルの変更通知を購読する
    ///
    /// `filter` を指定した場合、変更前後のいずれかが一致するイベントのみ配信される。
    async fn subscribe(
        &self,
        table: Table,
        filter: Option<Filter>,
    ) -> Result<BoxStream<'static, ChangeEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_eq_filter_compares_text_representation() {
        let row = record(json!({"id": 42, "owner_id": "l1", "note": null}));
        assert!(Filter::eq("id", "42").matches(&row));
        assert!(Filter::eq("id", 42).matches(&row));
        assert!(!Filter::eq("owner_id", "l2").matches(&row));
        assert!(!Filter::eq("note", Value::Null).matches(&row));
        assert!(!Filter::eq("missing", "x").matches(&row));
    }

    #[test]
    fn test_or_filter() {
        let row = record(json!({"borrower_id": "b1", "owner_id": "l1"}));
        let filter = Filter::or([Filter::eq("borrower_id", "x"), Filter::eq("owner_id", "l1")]);
        assert!(filter.matches(&row));
        assert_eq!(filter.columns(), vec!["borrower_id", "owner_id"]);
    }

    #[test]
    fn test_change_event_matches_old_or_new_row() {
        let event = ChangeEvent {
            table: Table::BorrowRequests,
            kind: ChangeKind::Delete,
            old: Some(record(json!({"id": 1, "borrower_id": "b1"}))),
            new: None,
        };
        assert!(event.matches(&Filter::eq("borrower_id", "b1")));
        assert!(!event.matches(&Filter::eq("borrower_id", "b2")));
    }
}
