use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::ports::table_store::{
    ChangeEvent, ChangeKind, Filter, Query, Record, Result, StoreError, Table,
    TableStore as TableStoreTrait, value_text,
};

const CHANNEL_CAPACITY: usize = 256;

/// Failure injection target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Select,
    Insert,
    Update,
    Delete,
}

#[derive(Default)]
struct State {
    tables: HashMap<Table, Vec<Record>>,
    next_id: i64,
    columns: HashMap<Table, HashSet<String>>,
    failures: HashSet<(Table, Operation)>,
    silent_updates: HashSet<Table>,
}

/// In-memory implementation of TableStore
///
/// Rows without an `id` get a serial number; rows without `created_at` get the
/// current time. Every write is broadcast to subscribers.
///
/// For tests it can declare a column set per table (unknown columns fail with
/// `MissingColumn`), fail selected operations, and apply updates without
/// returning the updated rows.
pub struct TableStore {
    state: Mutex<State>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl TableStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(State {
                next_id: 1,
                ..State::default()
            }),
            changes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Restrict a table to the given columns
    pub fn declare_columns(&self, table: Table, columns: &[&str]) {
        self.lock()
            .columns
            .insert(table, columns.iter().map(|c| c.to_string()).collect());
    }

    /// Make every call of `operation` on `table` fail with a backend error
    pub fn fail_on(&self, table: Table, operation: Operation) {
        self.lock().failures.insert((table, operation));
    }

    pub fn recover(&self, table: Table, operation: Operation) {
        self.lock().failures.remove(&(table, operation));
    }

    /// Apply updates on `table` but return no rows
    pub fn hide_update_results(&self, table: Table) {
        self.lock().silent_updates.insert(table);
    }

    /// Insert a row directly, bypassing failure injection and change events
    pub fn seed(&self, table: Table, record: Record) -> Record {
        let mut state = self.lock();
        let row = with_defaults(&mut state, record);
        state.tables.entry(table).or_default().push(row.clone());
        row
    }

    /// Snapshot of a table in insertion order
    pub fn rows(&self, table: Table) -> Vec<Record> {
        self.lock().tables.get(&table).cloned().unwrap_or_default()
    }

    fn publish(&self, event: ChangeEvent) {
        // No receivers is fine
        let _ = self.changes.send(event);
    }
}

impl Default for TableStore {
    fn default() -> Self {
        Self::new()
    }
}

fn check(state: &State, table: Table, operation: Operation) -> Result<()> {
    if state.failures.contains(&(table, operation)) {
        return Err(StoreError::backend(format!(
            "{:?} on {} failed",
            operation,
            table.as_str()
        )));
    }
    Ok(())
}

fn check_columns<'a>(
    state: &State,
    table: Table,
    columns: impl IntoIterator<Item = &'a str>,
) -> Result<()> {
    let Some(known) = state.columns.get(&table) else {
        return Ok(());
    };
    for column in columns {
        if !known.contains(column) {
            return Err(StoreError::MissingColumn {
                table: table.as_str().to_string(),
                column: column.to_string(),
            });
        }
    }
    Ok(())
}

fn with_defaults(state: &mut State, mut record: Record) -> Record {
    if record.get("id").is_none_or(Value::is_null) {
        record.insert("id".to_string(), Value::from(state.next_id));
        state.next_id += 1;
    }
    if record.get("created_at").is_none_or(Value::is_null) {
        record.insert(
            "created_at".to_string(),
            Value::from(Utc::now().to_rfc3339()),
        );
    }
    record
}

/// Numbers compare numerically, everything else by text. NULL sorts last in both directions.
fn compare(a: Option<&Value>, b: Option<&Value>, ascending: bool) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    let ordering = match (a, b) {
        (None, None) => return Ordering::Equal,
        (None, Some(_)) => return Ordering::Greater,
        (Some(_), None) => return Ordering::Less,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(x), Some(y)) => value_text(x).cmp(&value_text(y)),
    };
    if ascending { ordering } else { ordering.reverse() }
}

#[async_trait]
impl TableStoreTrait for TableStore {
    async fn select(&self, table: Table, query: Query) -> Result<Vec<Record>> {
        let state = self.lock();
        check(&state, table, Operation::Select)?;
        if let Some(filter) = &query.filter {
            check_columns(&state, table, filter.columns())?;
        }

        let mut rows: Vec<Record> = state
            .tables
            .get(&table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| query.filter.as_ref().is_none_or(|f| f.matches(row)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(order) = &query.order {
            check_columns(&state, table, [order.column.as_str()])?;
            rows.sort_by(|a, b| {
                compare(a.get(&order.column), b.get(&order.column), order.ascending)
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn insert(&self, table: Table, record: Record) -> Result<Record> {
        let row = {
            let mut state = self.lock();
            check(&state, table, Operation::Insert)?;
            check_columns(&state, table, record.keys().map(String::as_str))?;
            let row = with_defaults(&mut state, record);
            state.tables.entry(table).or_default().push(row.clone());
            row
        };

        tracing::debug!(table = table.as_str(), "Row inserted");
        self.publish(ChangeEvent {
            table,
            kind: ChangeKind::Insert,
            old: None,
            new: Some(row.clone()),
        });
        Ok(row)
    }

    async fn update(
        &self,
        table: Table,
        filter: Filter,
        changes: Record,
        limit: Option<usize>,
    ) -> Result<Vec<Record>> {
        let (events, silent) = {
            let mut state = self.lock();
            check(&state, table, Operation::Update)?;
            check_columns(&state, table, filter.columns())?;
            check_columns(&state, table, changes.keys().map(String::as_str))?;
            let silent = state.silent_updates.contains(&table);

            let mut events = Vec::new();
            if let Some(rows) = state.tables.get_mut(&table) {
                for row in rows.iter_mut().filter(|row| filter.matches(row)) {
                    if limit.is_some_and(|limit| events.len() >= limit) {
                        break;
                    }
                    let old = row.clone();
                    for (column, value) in &changes {
                        row.insert(column.clone(), value.clone());
                    }
                    events.push(ChangeEvent {
                        table,
                        kind: ChangeKind::Update,
                        old: Some(old),
                        new: Some(row.clone()),
                    });
                }
            }
            (events, silent)
        };

        let updated: Vec<Record> = events.iter().filter_map(|e| e.new.clone()).collect();
        tracing::debug!(table = table.as_str(), count = updated.len(), "Rows updated");
        for event in events {
            self.publish(event);
        }
        Ok(if silent { Vec::new() } else { updated })
    }

    async fn delete(&self, table: Table, filter: Filter) -> Result<u64> {
        let removed = {
            let mut state = self.lock();
            check(&state, table, Operation::Delete)?;
            check_columns(&state, table, filter.columns())?;
            let rows = state.tables.entry(table).or_default();
            let (removed, kept): (Vec<Record>, Vec<Record>) =
                rows.drain(..).partition(|row| filter.matches(row));
            *rows = kept;
            removed
        };

        let count = removed.len() as u64;
        for row in removed {
            self.publish(ChangeEvent {
                table,
                kind: ChangeKind::Delete,
                old: Some(row),
                new: None,
            });
        }
        Ok(count)
    }

    async fn subscribe(
        &self,
        table: Table,
        filter: Option<Filter>,
    ) -> Result<BoxStream<'static, ChangeEvent>> {
        let receiver = self.changes.subscribe();
        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((event, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Change subscriber lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |event| {
            let keep = event.table == table
                && filter.as_ref().is_none_or(|filter| event.matches(filter));
            futures::future::ready(keep)
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_insert_assigns_serial_id_and_created_at() {
        // Arrange
        let store = TableStore::new();

        // Act
        let first = store
            .insert(Table::Items, record(json!({"title": "Calculator"})))
            .await
            .unwrap();
        let second = store
            .insert(Table::Items, record(json!({"title": "Lab coat"})))
            .await
            .unwrap();

        // Assert
        assert_eq!(first["id"], json!(1));
        assert_eq!(second["id"], json!(2));
        assert!(first["created_at"].is_string());
    }

    #[tokio::test]
    async fn test_select_orders_descending_and_limits() {
        // Arrange
        let store = TableStore::new();
        store.seed(Table::Items, record(json!({"id": 1, "quantity": 3})));
        store.seed(Table::Items, record(json!({"id": 2, "quantity": 10})));
        store.seed(Table::Items, record(json!({"id": 3, "quantity": null})));

        // Act
        let rows = store
            .select(Table::Items, Query::new().order_by("quantity", false).limit(2))
            .await
            .unwrap();

        // Assert
        let ids: Vec<_> = rows.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!(2), json!(1)]);
    }

    #[tokio::test]
    async fn test_update_respects_limit_and_returns_rows() {
        // Arrange
        let store = TableStore::new();
        store.seed(Table::Items, record(json!({"owner_id": "l1", "quantity": 1})));
        store.seed(Table::Items, record(json!({"owner_id": "l1", "quantity": 1})));

        // Act
        let rows = store
            .update(
                Table::Items,
                Filter::eq("owner_id", "l1"),
                record(json!({"quantity": 0})),
                Some(1),
            )
            .await
            .unwrap();

        // Assert
        assert_eq!(rows.len(), 1);
        let zeroed = store
            .rows(Table::Items)
            .iter()
            .filter(|r| r["quantity"] == json!(0))
            .count();
        assert_eq!(zeroed, 1);
    }

    #[tokio::test]
    async fn test_declared_columns_report_missing_column() {
        // Arrange
        let store = TableStore::new();
        store.declare_columns(Table::BorrowRequests, &["id", "status"]);

        // Act
        let result = store
            .update(
                Table::BorrowRequests,
                Filter::eq("uuid", "x"),
                record(json!({"status": "approved"})),
                Some(1),
            )
            .await;

        // Assert
        assert!(matches!(result, Err(ref e) if e.is_missing_column()));
    }

    #[tokio::test]
    async fn test_failure_injection_and_recovery() {
        // Arrange
        let store = TableStore::new();
        store.fail_on(Table::Items, Operation::Select);

        // Act & Assert
        assert!(store.select(Table::Items, Query::new()).await.is_err());
        store.recover(Table::Items, Operation::Select);
        assert!(store.select(Table::Items, Query::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_hidden_update_applies_without_returning_rows() {
        // Arrange
        let store = TableStore::new();
        store.seed(Table::Items, record(json!({"id": 7, "quantity": 1})));
        store.hide_update_results(Table::Items);

        // Act
        let rows = store
            .update(
                Table::Items,
                Filter::eq("id", 7),
                record(json!({"quantity": 5})),
                None,
            )
            .await
            .unwrap();

        // Assert
        assert!(rows.is_empty());
        assert_eq!(store.rows(Table::Items)[0]["quantity"], json!(5));
    }

    #[tokio::test]
    async fn test_subscribe_filters_by_table_and_row() {
        // Arrange
        let store = TableStore::new();
        let mut stream = store
            .subscribe(Table::BorrowRequests, Some(Filter::eq("borrower_id", "b1")))
            .await
            .unwrap();

        // Act
        store
            .insert(Table::Items, record(json!({"title": "ignored"})))
            .await
            .unwrap();
        store
            .insert(Table::BorrowRequests, record(json!({"borrower_id": "b2"})))
            .await
            .unwrap();
        store
            .insert(Table::BorrowRequests, record(json!({"borrower_id": "b1"})))
            .await
            .unwrap();

        // Assert
        let event = stream.next().await.unwrap();
        assert_eq!(event.kind, ChangeKind::Insert);
        assert_eq!(event.new.unwrap()["borrower_id"], json!("b1"));
    }
}
