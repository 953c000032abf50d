use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::RequestStatus;

/// イベント：受け渡しが手配された
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleArranged {
    pub schedule_id: String,
    pub request_id: String,
    pub item_id: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub arranged_at: DateTime<Utc>,
}

/// イベント：返却用QRが発行された
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnQrIssued {
    pub schedule_id: String,
    pub issued_at: DateTime<Utc>,
}

/// イベント：物品が借り手に渡された
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemHandedOff {
    pub schedule_id: String,
    pub request_id: Option<String>,
    pub item_id: String,
    pub handed_off_at: DateTime<Utc>,
}

/// イベント：物品が返却された
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemReturned {
    pub schedule_id: String,
    pub request_id: Option<String>,
    pub item_id: String,
    pub returned_at: DateTime<Utc>,
    /// 貸し手による手動完了
    pub manual: bool,
}

/// スキャン・手動完了で発生するイベント
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleEvent {
    HandedOff(ItemHandedOff),
    Returned(ItemReturned),
}

/// 状態遷移に続いて行う副作用
///
/// それぞれ独立に実行され、失敗しても他を巻き戻さない。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    /// スケジュールの `status`/`return_ready` を保存する
    PersistSchedule,
    /// 紐づくリクエストを指定のステータスまで進める
    SyncRequest {
        request_id: String,
        target: RequestStatus,
    },
    /// 物品の数量を増減する
    AdjustQuantity { item_id: String, delta: i64 },
    /// 貸し手に借り手の評価を促す
    PromptLenderRating { request_id: String },
}

impl ScheduleEvent {
    pub fn schedule_id(&self) -> &str {
        match self {
            ScheduleEvent::HandedOff(e) => &e.schedule_id,
            ScheduleEvent::Returned(e) => &e.schedule_id,
        }
    }

    /// 純粋関数：イベントから副作用の一覧を導出する（実行順）
    pub fn effects(&self) -> Vec<SideEffect> {
        let mut effects = vec![SideEffect::PersistSchedule];
        match self {
            ScheduleEvent::HandedOff(e) => {
                if let Some(request_id) = &e.request_id {
                    effects.push(SideEffect::SyncRequest {
                        request_id: request_id.clone(),
                        target: RequestStatus::Ongoing,
                    });
                }
            }
            ScheduleEvent::Returned(e) => {
                if let Some(request_id) = &e.request_id {
                    effects.push(SideEffect::SyncRequest {
                        request_id: request_id.clone(),
                        target: RequestStatus::Completed,
                    });
                }
                if !e.item_id.is_empty() {
                    effects.push(SideEffect::AdjustQuantity {
                        item_id: e.item_id.clone(),
                        delta: 1,
                    });
                }
                if let Some(request_id) = &e.request_id {
                    effects.push(SideEffect::PromptLenderRating {
                        request_id: request_id.clone(),
                    });
                }
            }
        }
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handoff_effects() {
        let event = ScheduleEvent::HandedOff(ItemHandedOff {
            schedule_id: "s1".to_string(),
            request_id: Some("1".to_string()),
            item_id: "i1".to_string(),
            handed_off_at: Utc::now(),
        });
        assert_eq!(
            event.effects(),
            vec![
                SideEffect::PersistSchedule,
                SideEffect::SyncRequest {
                    request_id: "1".to_string(),
                    target: RequestStatus::Ongoing,
                },
            ]
        );
    }

    #[test]
    fn test_return_effects_restore_quantity_and_prompt_rating() {
        let event = ScheduleEvent::Returned(ItemReturned {
            schedule_id: "s1".to_string(),
            request_id: Some("1".to_string()),
            item_id: "i1".to_string(),
            returned_at: Utc::now(),
            manual: false,
        });
        let effects = event.effects();
        assert_eq!(effects.len(), 4);
        assert!(effects.contains(&SideEffect::AdjustQuantity {
            item_id: "i1".to_string(),
            delta: 1,
        }));
        assert_eq!(
            effects.last(),
            Some(&SideEffect::PromptLenderRating {
                request_id: "1".to_string()
            })
        );
    }

    #[test]
    fn test_return_without_request_only_persists_and_restocks() {
        let event = ScheduleEvent::Returned(ItemReturned {
            schedule_id: "s1".to_string(),
            request_id: None,
            item_id: "i1".to_string(),
            returned_at: Utc::now(),
            manual: true,
        });
        assert_eq!(event.effects().len(), 2);
    }
}
