use chrono::Utc;

use crate::domain::{self, AuthUser, MarketplaceItem};
use crate::ports::{ChangeEvent, ChangeKind, Filter, Query, Table};

use super::errors::{LendingError, Result};
use super::mapper::{self, ItemDraft};
use super::ServiceDependencies;

const EDIT_OWN_ONLY: &str = "You can only edit listings you created.";
const DELETE_OWN_ONLY: &str = "You can only delete listings you created.";

/// 出品物の在庫
pub struct ItemInventory {
    deps: ServiceDependencies,
    items: Vec<MarketplaceItem>,
    live: bool,
}

impl ItemInventory {
    pub fn new(deps: ServiceDependencies) -> Self {
        Self {
            deps,
            items: Vec::new(),
            live: true,
        }
    }

    pub fn items(&self) -> &[MarketplaceItem] {
        &self.items
    }

    pub fn get(&self, id: &str) -> Option<&MarketplaceItem> {
        self.items.iter().find(|item| item.id == id)
    }

    /// すべての出品物を取得する（新しい順）
    pub async fn load(&mut self) -> Result<()> {
        let rows = self
            .deps
            .table_store
            .select(Table::Items, Query::new().order_by("created_at", false))
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to load marketplace items");
                LendingError::remote("Failed to load items", e)
            })?;

        let now = Utc::now();
        let mut items: Vec<MarketplaceItem> =
            rows.iter().map(|row| mapper::map_item(row, now)).collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        self.items = items;
        Ok(())
    }

    /// 1件をリモートから取得してローカルに反映する
    pub async fn fetch(&mut self, item_id: &str) -> Result<MarketplaceItem> {
        let query = Query::new()
            .filter(Filter::eq("id", mapper::id_value(item_id)))
            .limit(1);
        let rows = self
            .deps
            .table_store
            .select(Table::Items, query)
            .await
            .map_err(|e| {
                tracing::error!(item_id = %item_id, error = %e, "Failed to load item");
                LendingError::remote("Failed to load item", e)
            })?;
        let row = rows.first().ok_or(LendingError::ItemNotFound)?;
        let item = mapper::map_item(row, Utc::now());
        self.upsert(item.clone());
        Ok(item)
    }

    /// 数量を増減する
    ///
    /// 最新の行を読んでから `max(0, quantity + delta)` を保存し、確認後にローカルを更新する。
    pub async fn adjust_quantity(&mut self, item_id: &str, delta: i64) -> Result<MarketplaceItem> {
        let current = self.fetch(item_id).await?;
        let next = domain::adjust_quantity(&current, delta);

        let rows = self
            .deps
            .table_store
            .update(
                Table::Items,
                Filter::eq("id", mapper::id_value(item_id)),
                mapper::quantity_changes(&next),
                Some(1),
            )
            .await
            .map_err(|e| {
                tracing::error!(item_id = %item_id, error = %e, "Failed to update item quantity");
                LendingError::remote("Failed to update item quantity", e)
            })?;

        let Some(row) = rows.first() else {
            tracing::warn!(item_id = %item_id, quantity = next.quantity, "Item quantity update did not match any row");
            return Err(LendingError::ItemNotFound);
        };

        let confirmed = mapper::map_item(row, Utc::now());
        tracing::info!(item_id = %item_id, quantity = confirmed.quantity, delta, "Item quantity adjusted");
        self.upsert(confirmed.clone());
        Ok(confirmed)
    }

    /// 出品する
    ///
    /// ビジネスルール：
    /// - タイトルは必須（前後の空白を除いて空なら拒否）
    /// - 数量は正の整数、それ以外は1
    /// - 所有者と貸し手情報は出品者から取る
    pub async fn create(
        &mut self,
        viewer: &AuthUser,
        draft: &ItemDraft,
    ) -> Result<MarketplaceItem> {
        validate_item_draft(draft)?;

        let row = self
            .deps
            .table_store
            .insert(Table::Items, mapper::new_item_record(draft, viewer))
            .await
            .map_err(|e| {
                tracing::error!(owner_id = %viewer.id, error = %e, "Failed to list item");
                LendingError::remote("Failed to list item", e)
            })?;

        let created = mapper::map_item(&row, Utc::now());
        tracing::info!(
            item_id = %created.id,
            owner_id = %viewer.id,
            quantity = created.quantity,
            "Item listed"
        );
        self.upsert(created.clone());
        Ok(created)
    }

    /// 出品を編集する（所有者のみ）
    pub async fn update(
        &mut self,
        viewer: &AuthUser,
        item_id: &str,
        draft: &ItemDraft,
    ) -> Result<MarketplaceItem> {
        validate_item_draft(draft)?;
        let current = self.fetch(item_id).await?;
        if !current.is_owned_by(&viewer.id) {
            return Err(LendingError::Validation(EDIT_OWN_ONLY.to_string()));
        }

        let rows = self
            .deps
            .table_store
            .update(
                Table::Items,
                Filter::eq("id", mapper::id_value(&current.id)),
                mapper::item_changes(draft, viewer),
                Some(1),
            )
            .await
            .map_err(|e| {
                tracing::error!(item_id = %item_id, error = %e, "Failed to update item");
                LendingError::remote("Failed to update item", e)
            })?;

        let Some(row) = rows.first() else {
            tracing::warn!(item_id = %item_id, "Item update did not match any row");
            return Err(LendingError::ItemNotFound);
        };

        let updated = mapper::map_item(row, Utc::now());
        tracing::info!(item_id = %updated.id, "Item updated");
        self.upsert(updated.clone());
        Ok(updated)
    }

    /// 出品を削除する（所有者のみ）
    pub async fn delete(&mut self, viewer: &AuthUser, item_id: &str) -> Result<MarketplaceItem> {
        let current = self.fetch(item_id).await?;
        if !current.is_owned_by(&viewer.id) {
            return Err(LendingError::Validation(DELETE_OWN_ONLY.to_string()));
        }

        let removed = self
            .deps
            .table_store
            .delete(Table::Items, Filter::eq("id", mapper::id_value(&current.id)))
            .await
            .map_err(|e| {
                tracing::error!(item_id = %item_id, error = %e, "Failed to delete item");
                LendingError::remote("Failed to delete item. Please try again.", e)
            })?;
        if removed == 0 {
            tracing::warn!(item_id = %item_id, "Item delete did not match any row");
            return Err(LendingError::ItemNotFound);
        }

        tracing::info!(item_id = %item_id, "Item deleted");
        self.items.retain(|item| item.id != current.id);
        Ok(current)
    }

    /// 以降のリアルタイム変更を無視する
    pub fn close(&mut self) {
        self.live = false;
    }

    pub fn apply_realtime_change(&mut self, event: &ChangeEvent) {
        if !self.live || event.table != Table::Items {
            return;
        }
        match event.kind {
            ChangeKind::Delete => {
                if let Some(old) = &event.old {
                    let removed = mapper::map_item(old, Utc::now());
                    self.items.retain(|item| item.id != removed.id);
                }
            }
            ChangeKind::Insert | ChangeKind::Update => {
                if let Some(new) = &event.new {
                    self.upsert(mapper::map_item(new, Utc::now()));
                }
            }
        }
    }

    fn upsert(&mut self, item: MarketplaceItem) {
        match self.items.iter_mut().find(|existing| existing.id == item.id) {
            Some(existing) => *existing = item,
            None => self.items.insert(0, item),
        }
    }
}

fn validate_item_draft(draft: &ItemDraft) -> Result<()> {
    if draft.title.trim().is_empty() {
        return Err(LendingError::Validation("Item title is required.".to_string()));
    }
    Ok(())
}
