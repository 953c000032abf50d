use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::{IdSource, KeyColumn, RawKey, RawKeys, StarRating, TransitionError};

/// 貸出リクエストのステータス
///
/// `pending → approved → ongoing → completed` の一方向。
/// 例外は `pending → rejected` の分岐のみ。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Ongoing,
    Rejected,
    Completed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Ongoing => "ongoing",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Completed => "completed",
        }
    }

    /// 貸出が進行中とみなされるか（重複リクエスト判定用）
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RequestStatus::Pending | RequestStatus::Approved | RequestStatus::Ongoing
        )
    }

    /// 本線上の位置（`rejected` は本線外）
    fn rank(&self) -> Option<u8> {
        match self {
            RequestStatus::Pending => Some(0),
            RequestStatus::Approved => Some(1),
            RequestStatus::Ongoing => Some(2),
            RequestStatus::Completed => Some(3),
            RequestStatus::Rejected => None,
        }
    }

    /// 1段階の遷移が許されるか
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        matches!(
            (self, next),
            (RequestStatus::Pending, RequestStatus::Approved)
                | (RequestStatus::Pending, RequestStatus::Rejected)
                | (RequestStatus::Approved, RequestStatus::Ongoing)
                | (RequestStatus::Ongoing, RequestStatus::Completed)
        )
    }

    /// 既に `target` に到達済み、またはそれより先にいるか
    pub fn has_reached(&self, target: RequestStatus) -> bool {
        match (self.rank(), target.rank()) {
            (Some(current), Some(target)) => current >= target,
            _ => *self == target,
        }
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(RequestStatus::Pending),
            "approved" => Ok(RequestStatus::Approved),
            "ongoing" => Ok(RequestStatus::Ongoing),
            "rejected" => Ok(RequestStatus::Rejected),
            "completed" => Ok(RequestStatus::Completed),
            _ => Err(format!("Invalid request status: {}", s)),
        }
    }
}

/// 貸し手の判断
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn target_status(&self) -> RequestStatus {
        match self {
            Decision::Approve => RequestStatus::Approved,
            Decision::Reject => RequestStatus::Rejected,
        }
    }
}

/// 一方向分のフィードバック
///
/// 不変条件：評価・メッセージ・日時はまとめて設定されるか、まったく設定されない。
/// `Option<Feedback>` で表現することで片方だけの状態を作れないようにする。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    pub rating: StarRating,
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

/// 貸出リクエスト集約 - 1件の「借りたい」取引
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BorrowRequest {
    // 識別子（出所付き）
    pub id: String,
    pub id_source: IdSource,
    pub raw_keys: RawKeys,

    // 物品への参照
    pub item_id: String,
    pub item_title: String,
    pub item_image: Option<String>,

    // 借り手
    pub borrower_id: String,
    pub borrower_name: String,
    pub borrower_email: String,
    pub borrower_rating: f64,

    // 貸し手
    pub owner_id: Option<String>,
    pub lender_name: String,
    pub lender_email: Option<String>,

    // 受け渡しの希望
    pub request_date: DateTime<Utc>,
    pub preferred_date: Option<NaiveDate>,
    pub return_date: Option<NaiveDate>,
    pub meeting_place: Option<String>,
    pub meeting_time: Option<String>,

    pub message: String,
    pub decision_message: Option<String>,
    pub status: RequestStatus,

    /// 借り手 → 貸し手の評価
    pub borrower_feedback: Option<Feedback>,
    /// 貸し手 → 借り手の評価
    pub lender_feedback: Option<Feedback>,
}

impl BorrowRequest {
    /// 更新時に使う主キー列と値
    pub fn primary_key(&self) -> (KeyColumn, serde_json::Value) {
        let column = self.id_source.key_column();
        let raw = match column {
            KeyColumn::Id => self.raw_keys.id.clone(),
            KeyColumn::RequestId => self.raw_keys.request_id.clone(),
            KeyColumn::Uuid => self.raw_keys.uuid.clone().map(RawKey::Text),
        };
        let value = raw
            .map(|key| key.to_json())
            .unwrap_or_else(|| serde_json::Value::from(self.id.clone()));
        (column, value)
    }

    /// ローカルIDまたはいずれかの生キーが一致するか
    pub fn is_identified_by(&self, id: &str) -> bool {
        self.id == id || self.raw_keys.matches(id)
    }

    pub fn is_borrower(&self, user_id: &str) -> bool {
        !self.borrower_id.is_empty() && self.borrower_id == user_id
    }

    pub fn is_owner(&self, user_id: &str) -> bool {
        self.owner_id.as_deref().is_some_and(|owner| owner == user_id)
    }
}

/// 純粋関数：状態遷移を検証する
///
/// 1段階の遷移のみ受け付ける。飛び越しや逆行はエラー。
pub fn ensure_transition(
    current: RequestStatus,
    next: RequestStatus,
) -> Result<(), TransitionError> {
    if current.can_transition_to(next) {
        Ok(())
    } else {
        Err(TransitionError {
            from: current,
            to: next,
        })
    }
}

/// 純粋関数：`target` までの遷移経路を求める
///
/// ビジネスルール：
/// - 進められるのは `approved → ongoing → completed` の本線のみ
/// - 既に到達済みなら空の経路（何もしない、逆行しない）
/// - `pending`/`rejected` からはスケジュール同期で進められない
pub fn advancement_path(
    current: RequestStatus,
    target: RequestStatus,
) -> Result<Vec<RequestStatus>, TransitionError> {
    if current.has_reached(target) {
        return Ok(Vec::new());
    }

    let chain = [
        RequestStatus::Approved,
        RequestStatus::Ongoing,
        RequestStatus::Completed,
    ];
    let (Some(start), Some(end)) = (
        chain.iter().position(|s| *s == current),
        chain.iter().position(|s| *s == target),
    ) else {
        return Err(TransitionError {
            from: current,
            to: target,
        });
    };

    Ok(chain[start + 1..=end].to_vec())
}

/// 純粋関数：同じ借り手が同じ物品に進行中のリクエストを持っているか
pub fn has_active_request(requests: &[BorrowRequest], item_id: &str, borrower_id: &str) -> bool {
    requests.iter().any(|req| {
        req.item_id == item_id && req.borrower_id == borrower_id && req.status.is_active()
    })
}

/// 純粋関数：リクエスト日時の降順に並べる（安定ソート）
pub fn sort_newest_first(requests: &mut [BorrowRequest]) {
    requests.sort_by(|a, b| b.request_date.cmp(&a.request_date));
}

fn with_override(
    request: &BorrowRequest,
    overrides: &HashMap<String, RequestStatus>,
) -> BorrowRequest {
    match overrides.get(&request.id) {
        Some(status) if *status != request.status => BorrowRequest {
            status: *status,
            ..request.clone()
        },
        _ => request.clone(),
    }
}

/// 借り手として見えるリクエスト（スケジュール由来の上書きを適用）
pub fn borrower_requests_for_user(
    requests: &[BorrowRequest],
    user_id: &str,
    overrides: &HashMap<String, RequestStatus>,
) -> Vec<BorrowRequest> {
    if user_id.is_empty() {
        return Vec::new();
    }
    requests
        .iter()
        .filter(|req| req.is_borrower(user_id))
        .map(|req| with_override(req, overrides))
        .collect()
}

/// 貸し手として見えるリクエスト（スケジュール由来の上書きを適用）
pub fn lender_requests_for_user(
    requests: &[BorrowRequest],
    user_id: &str,
    overrides: &HashMap<String, RequestStatus>,
) -> Vec<BorrowRequest> {
    if user_id.is_empty() {
        return Vec::new();
    }
    requests
        .iter()
        .filter(|req| req.is_owner(user_id))
        .map(|req| with_override(req, overrides))
        .collect()
}

/// 物品IDごとの進行中リクエスト
///
/// 同じ物品に複数ある場合は後ろ（古い方）が勝つ。
pub fn active_requests_by_item(requests: &[BorrowRequest]) -> HashMap<String, BorrowRequest> {
    requests
        .iter()
        .filter(|req| req.status.is_active())
        .map(|req| (req.item_id.clone(), req.clone()))
        .collect()
}

pub fn count_pending(requests: &[BorrowRequest]) -> usize {
    requests
        .iter()
        .filter(|req| req.status == RequestStatus::Pending)
        .count()
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn request(
        id: &str,
        item_id: &str,
        borrower_id: &str,
        status: RequestStatus,
    ) -> BorrowRequest {
        BorrowRequest {
            id: id.to_string(),
            id_source: IdSource::Id,
            raw_keys: RawKeys {
                id: Some(RawKey::Text(id.to_string())),
                ..RawKeys::default()
            },
            item_id: item_id.to_string(),
            item_title: "Graphing Calculator".to_string(),
            item_image: None,
            borrower_id: borrower_id.to_string(),
            borrower_name: "Borrower One".to_string(),
            borrower_email: "b1@campus.test".to_string(),
            borrower_rating: 0.0,
            owner_id: Some("l1".to_string()),
            lender_name: "Lender One".to_string(),
            lender_email: Some("l1@campus.test".to_string()),
            request_date: Utc::now(),
            preferred_date: NaiveDate::from_ymd_opt(2025, 10, 20),
            return_date: NaiveDate::from_ymd_opt(2025, 10, 27),
            meeting_place: Some("Library Atrium".to_string()),
            meeting_time: Some("14:00".to_string()),
            message: String::new(),
            decision_message: None,
            status,
            borrower_feedback: None,
            lender_feedback: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::request;
    use super::*;
    use chrono::Duration;

    const ALL: [RequestStatus; 5] = [
        RequestStatus::Pending,
        RequestStatus::Approved,
        RequestStatus::Ongoing,
        RequestStatus::Rejected,
        RequestStatus::Completed,
    ];

    #[test]
    fn test_only_forward_single_step_transitions_are_allowed() {
        let allowed = [
            (RequestStatus::Pending, RequestStatus::Approved),
            (RequestStatus::Pending, RequestStatus::Rejected),
            (RequestStatus::Approved, RequestStatus::Ongoing),
            (RequestStatus::Ongoing, RequestStatus::Completed),
        ];
        for from in ALL {
            for to in ALL {
                let expected = allowed.contains(&(from, to));
                assert_eq!(
                    ensure_transition(from, to).is_ok(),
                    expected,
                    "{:?} -> {:?}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_advancement_path_walks_the_chain() {
        assert_eq!(
            advancement_path(RequestStatus::Approved, RequestStatus::Completed).unwrap(),
            vec![RequestStatus::Ongoing, RequestStatus::Completed]
        );
        assert_eq!(
            advancement_path(RequestStatus::Ongoing, RequestStatus::Completed).unwrap(),
            vec![RequestStatus::Completed]
        );
    }

    #[test]
    fn test_advancement_path_never_moves_backward() {
        assert!(
            advancement_path(RequestStatus::Completed, RequestStatus::Ongoing)
                .unwrap()
                .is_empty()
        );
        assert!(
            advancement_path(RequestStatus::Ongoing, RequestStatus::Ongoing)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_advancement_path_rejects_pending_and_rejected() {
        assert!(advancement_path(RequestStatus::Pending, RequestStatus::Ongoing).is_err());
        assert!(advancement_path(RequestStatus::Rejected, RequestStatus::Completed).is_err());
    }

    #[test]
    fn test_has_active_request_ignores_finished_requests() {
        let requests = vec![
            request("1", "i1", "b1", RequestStatus::Completed),
            request("2", "i1", "b1", RequestStatus::Rejected),
            request("3", "i2", "b1", RequestStatus::Pending),
        ];
        assert!(!has_active_request(&requests, "i1", "b1"));
        assert!(has_active_request(&requests, "i2", "b1"));
        assert!(!has_active_request(&requests, "i2", "b2"));
    }

    #[test]
    fn test_sort_newest_first() {
        let now = Utc::now();
        let mut older = request("1", "i1", "b1", RequestStatus::Pending);
        older.request_date = now - Duration::days(2);
        let mut newer = request("2", "i2", "b1", RequestStatus::Pending);
        newer.request_date = now;
        let mut requests = vec![older, newer];
        sort_newest_first(&mut requests);
        assert_eq!(requests[0].id, "2");
    }

    #[test]
    fn test_views_apply_overrides() {
        let requests = vec![
            request("1", "i1", "b1", RequestStatus::Approved),
            request("2", "i2", "b2", RequestStatus::Approved),
        ];
        let overrides = HashMap::from([("1".to_string(), RequestStatus::Ongoing)]);

        let borrower = borrower_requests_for_user(&requests, "b1", &overrides);
        assert_eq!(borrower.len(), 1);
        assert_eq!(borrower[0].status, RequestStatus::Ongoing);

        let lender = lender_requests_for_user(&requests, "l1", &overrides);
        assert_eq!(lender.len(), 2);
        assert_eq!(lender[1].status, RequestStatus::Approved);

        assert!(borrower_requests_for_user(&requests, "", &overrides).is_empty());
    }

    #[test]
    fn test_primary_key_keeps_numeric_type() {
        let mut req = request("42", "i1", "b1", RequestStatus::Pending);
        req.raw_keys.id = Some(RawKey::Number(42));
        let (column, value) = req.primary_key();
        assert_eq!(column, KeyColumn::Id);
        assert_eq!(value, serde_json::json!(42));
    }
}
