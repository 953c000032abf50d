use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{BorrowRequest, Feedback, IdSource, KeyColumn, RawKey, RawKeys, StarRating};

/// 評価の方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RatingDirection {
    /// 借り手が貸し手を評価する
    BorrowerToLender,
    /// 貸し手が借り手を評価する
    LenderToBorrower,
}

impl RatingDirection {
    /// 永続化列の接頭辞（`<prefix>_feedback_rating` など）
    pub fn column_prefix(&self) -> &'static str {
        match self {
            RatingDirection::BorrowerToLender => "borrower",
            RatingDirection::LenderToBorrower => "lender",
        }
    }

    pub fn feedback_of<'a>(&self, request: &'a BorrowRequest) -> Option<&'a Feedback> {
        match self {
            RatingDirection::BorrowerToLender => request.borrower_feedback.as_ref(),
            RatingDirection::LenderToBorrower => request.lender_feedback.as_ref(),
        }
    }
}

/// 評価対象の取引
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingContext {
    pub item_title: String,
    pub target_user_name: String,
    pub target_user_id: Option<String>,
    pub request_id: String,
    pub request_id_source: IdSource,
    pub raw_keys: RawKeys,
    pub direction: RatingDirection,
    /// 既に送信済みの評価（再送信時の初期値）
    pub existing: Option<Feedback>,
}

impl RatingContext {
    /// リクエストから評価コンテキストを作る
    pub fn for_request(request: &BorrowRequest, direction: RatingDirection) -> Self {
        let (target_user_name, target_user_id) = match direction {
            RatingDirection::BorrowerToLender => {
                (request.lender_name.clone(), request.owner_id.clone())
            }
            RatingDirection::LenderToBorrower => (
                request.borrower_name.clone(),
                Some(request.borrower_id.clone()).filter(|id| !id.is_empty()),
            ),
        };
        Self {
            item_title: request.item_title.clone(),
            target_user_name,
            target_user_id,
            request_id: request.id.clone(),
            request_id_source: request.id_source,
            raw_keys: request.raw_keys.clone(),
            direction,
            existing: direction.feedback_of(request).cloned(),
        }
    }
}

/// 更新対象を特定するための（列, 値）候補
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierCandidate {
    pub column: KeyColumn,
    pub value: RawKey,
}

/// UUID形式（ハイフン区切り36文字）か
pub fn is_uuid_shaped(value: &str) -> bool {
    value.len() == 36 && Uuid::try_parse(value).is_ok()
}

#[derive(Default)]
struct CandidateList {
    items: Vec<IdentifierCandidate>,
}

impl CandidateList {
    fn add(&mut self, column: KeyColumn, value: &RawKey) {
        let value = match value {
            RawKey::Number(n) => RawKey::Number(*n),
            RawKey::Text(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    return;
                }
                // 数値として解釈できる文字列は数値に寄せる
                match trimmed.parse::<i64>() {
                    Ok(n) => RawKey::Number(n),
                    Err(_) => RawKey::Text(trimmed.to_string()),
                }
            }
        };
        let exists = self
            .items
            .iter()
            .any(|c| c.column == column && c.value.as_text() == value.as_text());
        if !exists {
            self.items.push(IdentifierCandidate { column, value });
        }
    }

    fn add_uuid(&mut self, value: &str) {
        let trimmed = value.trim();
        if is_uuid_shaped(trimmed) {
            self.add(KeyColumn::Uuid, &RawKey::Text(trimmed.to_string()));
        }
    }
}

/// 純粋関数：既知のすべての識別子から更新候補を組み立てる
///
/// 順序：
/// 1. 永続化された生キー（id → uuid → request_id）
/// 2. ローカルIDを出所の列で
/// 3. ローカルIDを他の列で（数値なら id/request_id、UUID形式なら uuid）
///
/// 重複は除く。
pub fn identifier_candidates(context: &RatingContext) -> Vec<IdentifierCandidate> {
    let mut list = CandidateList::default();
    let keys = &context.raw_keys;

    if let Some(id) = &keys.id {
        list.add(KeyColumn::Id, id);
    }
    if let Some(uuid) = &keys.uuid {
        list.add_uuid(uuid);
    }
    if let Some(request_id) = &keys.request_id {
        list.add(KeyColumn::RequestId, request_id);
    }

    let local = context.request_id.trim();
    if !local.is_empty() {
        let local_key = RawKey::Text(local.to_string());
        list.add(context.request_id_source.key_column(), &local_key);
        if local_key.as_number().is_some() {
            list.add(KeyColumn::Id, &local_key);
            list.add(KeyColumn::RequestId, &local_key);
        }
        list.add_uuid(local);
    }

    list.items
}

/// 純粋関数：評価をリクエストに反映する（同じ方向の既存評価は上書き）
pub fn apply_feedback(
    request: &BorrowRequest,
    direction: RatingDirection,
    rating: StarRating,
    review: &str,
    at: DateTime<Utc>,
) -> BorrowRequest {
    let trimmed = review.trim();
    let feedback = Feedback {
        rating,
        message: (!trimmed.is_empty()).then(|| trimmed.to_string()),
        at,
    };
    let mut updated = request.clone();
    match direction {
        RatingDirection::BorrowerToLender => updated.borrower_feedback = Some(feedback),
        RatingDirection::LenderToBorrower => updated.lender_feedback = Some(feedback),
    }
    updated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RequestStatus;
    use crate::domain::borrow_request::fixtures::request;

    fn context(raw_keys: RawKeys, request_id: &str, source: IdSource) -> RatingContext {
        let mut req = request(request_id, "i1", "b1", RequestStatus::Completed);
        req.raw_keys = raw_keys;
        req.id_source = source;
        RatingContext::for_request(&req, RatingDirection::LenderToBorrower)
    }

    #[test]
    fn test_candidates_start_with_raw_keys_and_dedupe() {
        let keys = RawKeys {
            id: Some(RawKey::Number(42)),
            uuid: None,
            request_id: None,
        };
        let candidates = identifier_candidates(&context(keys, "42", IdSource::Id));
        assert_eq!(
            candidates,
            vec![
                IdentifierCandidate {
                    column: KeyColumn::Id,
                    value: RawKey::Number(42),
                },
                IdentifierCandidate {
                    column: KeyColumn::RequestId,
                    value: RawKey::Number(42),
                },
            ]
        );
    }

    #[test]
    fn test_candidates_include_uuid_only_when_shaped() {
        let uuid = "7d1c1c0e-3f7a-4e4b-9a55-0d9c9b2f3b11";
        let keys = RawKeys {
            id: None,
            uuid: Some(uuid.to_string()),
            request_id: None,
        };
        let candidates = identifier_candidates(&context(keys, uuid, IdSource::Uuid));
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].column, KeyColumn::Uuid);

        let keys = RawKeys {
            id: None,
            uuid: Some("not-a-uuid".to_string()),
            request_id: None,
        };
        let candidates = identifier_candidates(&context(keys, "req-1", IdSource::Generated));
        assert_eq!(
            candidates,
            vec![IdentifierCandidate {
                column: KeyColumn::Id,
                value: RawKey::Text("req-1".to_string()),
            }]
        );
    }

    #[test]
    fn test_context_carries_existing_feedback() {
        let mut req = request("1", "i1", "b1", RequestStatus::Completed);
        req.lender_feedback = Some(Feedback {
            rating: StarRating::try_from(4i64).unwrap(),
            message: Some("On time".to_string()),
            at: Utc::now(),
        });
        let ctx = RatingContext::for_request(&req, RatingDirection::LenderToBorrower);
        assert_eq!(ctx.target_user_id.as_deref(), Some("b1"));
        assert_eq!(ctx.existing.unwrap().message.as_deref(), Some("On time"));

        let ctx = RatingContext::for_request(&req, RatingDirection::BorrowerToLender);
        assert_eq!(ctx.target_user_name, "Lender One");
        assert!(ctx.existing.is_none());
    }

    #[test]
    fn test_apply_feedback_overwrites_same_direction() {
        let req = request("1", "i1", "b1", RequestStatus::Completed);
        let first = apply_feedback(
            &req,
            RatingDirection::BorrowerToLender,
            StarRating::try_from(3i64).unwrap(),
            "  ",
            Utc::now(),
        );
        assert_eq!(first.borrower_feedback.as_ref().unwrap().message, None);

        let second = apply_feedback(
            &first,
            RatingDirection::BorrowerToLender,
            StarRating::try_from(5i64).unwrap(),
            "Great",
            Utc::now(),
        );
        let feedback = second.borrower_feedback.unwrap();
        assert_eq!(feedback.rating.value(), 5);
        assert!(second.lender_feedback.is_none());
    }
}
