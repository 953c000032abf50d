use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const AVAILABLE: &str = "Available";
pub const UNAVAILABLE: &str = "Unavailable";

/// 貸し手の公開情報
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LenderSummary {
    pub name: String,
    pub rating: f64,
    pub reviews: u32,
    pub email: Option<String>,
}

/// 出品物
///
/// `quantity` が貸出可否の唯一の根拠。`availability` は常に `quantity > 0` に従う。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketplaceItem {
    pub id: String,
    pub title: String,
    pub category: String,
    pub condition: String,
    pub image: Option<String>,
    pub owner_id: Option<String>,
    pub lender: LenderSummary,
    pub availability: String,
    pub deposit: bool,
    pub campus: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub quantity: i64,
}

impl MarketplaceItem {
    pub fn is_available(&self) -> bool {
        self.quantity > 0
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        !user_id.is_empty() && self.owner_id.as_deref() == Some(user_id)
    }
}

/// 数量に対応する貸出可否ラベル
pub fn availability_label(quantity: i64) -> &'static str {
    if quantity > 0 { AVAILABLE } else { UNAVAILABLE }
}

/// 純粋関数：数量を増減する
///
/// ビジネスルール：
/// - 0未満にはならない
/// - 貸出可否ラベルを数量に合わせる
pub fn adjust_quantity(item: &MarketplaceItem, delta: i64) -> MarketplaceItem {
    let quantity = (item.quantity + delta).max(0);
    MarketplaceItem {
        quantity,
        availability: availability_label(quantity).to_string(),
        ..item.clone()
    }
}

/// 純粋関数：出品時の数量を決める
///
/// 正の有限値なら切り捨て、それ以外（0以下・数値でない）は1とする。
pub fn listing_quantity(raw: Option<f64>) -> i64 {
    match raw {
        Some(value) if value.is_finite() && value > 0.0 => (value.floor() as i64).max(1),
        _ => 1,
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn item(id: &str, quantity: i64) -> MarketplaceItem {
        MarketplaceItem {
            id: id.to_string(),
            title: "Graphing Calculator".to_string(),
            category: "Electronics".to_string(),
            condition: "Good".to_string(),
            image: None,
            owner_id: Some("l1".to_string()),
            lender: LenderSummary {
                name: "Lender One".to_string(),
                rating: 0.0,
                reviews: 0,
                email: Some("l1@campus.test".to_string()),
            },
            availability: availability_label(quantity).to_string(),
            deposit: false,
            campus: "Main Campus".to_string(),
            description: String::new(),
            created_at: Utc::now(),
            quantity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::item;
    use super::*;

    #[test]
    fn test_adjust_quantity_syncs_availability() {
        let taken = adjust_quantity(&item("i1", 1), -1);
        assert_eq!(taken.quantity, 0);
        assert_eq!(taken.availability, UNAVAILABLE);

        let restored = adjust_quantity(&taken, 1);
        assert_eq!(restored.quantity, 1);
        assert_eq!(restored.availability, AVAILABLE);
    }

    #[test]
    fn test_adjust_quantity_never_goes_negative() {
        let adjusted = adjust_quantity(&item("i1", 0), -3);
        assert_eq!(adjusted.quantity, 0);
        assert!(!adjusted.is_available());
    }

    #[test]
    fn test_listing_quantity_falls_back_to_one() {
        assert_eq!(listing_quantity(Some(3.7)), 3);
        assert_eq!(listing_quantity(Some(0.0)), 1);
        assert_eq!(listing_quantity(Some(-2.0)), 1);
        assert_eq!(listing_quantity(Some(f64::NAN)), 1);
        assert_eq!(listing_quantity(None), 1);
    }
}
