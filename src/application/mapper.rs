//! 永続化された行（ゆるい型のJSON）と厳密なドメイン型の境界
//!
//! 読み込みは決して失敗しない。欠けた値は既定値で補う。

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Value, json};

use crate::domain::{
    AuthUser, BorrowRequest, BorrowSchedule, Feedback, IdSource, LenderSummary, MarketplaceItem,
    QrCode, QrKind, RatingDirection, RawKey, RawKeys, RequestStatus, ScheduleOrigin,
    ScheduleStatus, StarRating, availability_label, listing_quantity, truncate_time,
};
use crate::ports::Record;

pub const PLACEHOLDER_ITEM_TITLE: &str = "Borrowed Item";
pub const PLACEHOLDER_BORROWER: &str = "Borrower";
pub const PLACEHOLDER_LENDER: &str = "Lender";
pub const PLACEHOLDER_UNTITLED: &str = "Untitled Item";
pub const PLACEHOLDER_COMMUNITY_LENDER: &str = "Community Lender";
pub const PLACEHOLDER_CAMPUS: &str = "Main Campus";

/// 最初に見つかった非NULLの値（snake_case → camelCase の順で渡す）
fn first<'a>(record: &'a Record, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| record.get(*key))
        .find(|value| !value.is_null())
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn string_or(record: &Record, keys: &[&str], fallback: &str) -> String {
    first(record, keys)
        .map(text)
        .unwrap_or_else(|| fallback.to_string())
}

fn optional_string(record: &Record, keys: &[&str]) -> Option<String> {
    first(record, keys).map(text)
}

fn number(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|n| n.is_finite())
}

fn number_or(record: &Record, keys: &[&str], fallback: f64) -> f64 {
    first(record, keys).and_then(number).unwrap_or(fallback)
}

fn boolean(record: &Record, keys: &[&str]) -> bool {
    match first(record, keys) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.trim().to_lowercase().as_str(), "true" | "t" | "1"),
        Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
        _ => false,
    }
}

/// 日時として解釈する（RFC 3339、タイムゾーンなし、日付のみ、エポックミリ秒）
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => {
            let raw = raw.trim();
            if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
                return Some(parsed.with_timezone(&Utc));
            }
            for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
                if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, format) {
                    return Some(parsed.and_utc());
                }
            }
            parse_date(value).and_then(|date| date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc()))
        }
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

/// 日付として解釈する（先頭10文字 `YYYY-MM-DD`）
pub fn parse_date(value: &Value) -> Option<NaiveDate> {
    let raw = text(value);
    let head: String = raw.trim().chars().take(10).collect();
    NaiveDate::parse_from_str(&head, "%Y-%m-%d").ok()
}

fn raw_key(value: &Value) -> Option<RawKey> {
    match value {
        Value::Null => None,
        Value::Number(n) => Some(
            n.as_i64()
                .map(RawKey::Number)
                .unwrap_or_else(|| RawKey::Text(n.to_string())),
        ),
        other => Some(RawKey::Text(text(other))),
    }
}

fn feedback(
    record: &Record,
    rating_keys: &[&str],
    message_keys: &[&str],
    at_keys: &[&str],
    fallback_at: DateTime<Utc>,
) -> Option<Feedback> {
    // 0や範囲外の評価は未評価として扱う
    let rating = first(record, rating_keys)
        .and_then(number)
        .and_then(|n| StarRating::try_from(n.round() as i64).ok())?;
    Some(Feedback {
        rating,
        message: optional_string(record, message_keys).filter(|m| !m.trim().is_empty()),
        at: first(record, at_keys)
            .and_then(parse_timestamp)
            .unwrap_or(fallback_at),
    })
}

/// 貸出リクエストの行を変換する
///
/// IDは `id` → `request_id` → `uuid` の順に採用し、どれもなければ生成する。
pub fn map_borrow_request(record: &Record, now: DateTime<Utc>) -> BorrowRequest {
    let raw_keys = RawKeys {
        id: first(record, &["id"]).and_then(raw_key),
        uuid: optional_string(record, &["uuid"]),
        request_id: first(record, &["request_id"]).and_then(raw_key),
    };

    let non_empty = |key: &Option<RawKey>| key.as_ref().map(RawKey::as_text).filter(|s| !s.is_empty());
    let (id, id_source) = if let Some(id) = non_empty(&raw_keys.id) {
        (id, IdSource::Id)
    } else if let Some(id) = non_empty(&raw_keys.request_id) {
        (id, IdSource::RequestId)
    } else if let Some(uuid) = raw_keys.uuid.clone().filter(|s| !s.is_empty()) {
        (uuid, IdSource::Uuid)
    } else {
        (format!("req-{}", now.timestamp_millis()), IdSource::Generated)
    };

    let request_date = first(record, &["created_at"])
        .or_else(|| first(record, &["request_date", "requestDate"]))
        .and_then(parse_timestamp)
        .unwrap_or(now);

    let status = first(record, &["status"])
        .and_then(|value| text(value).parse::<RequestStatus>().ok())
        .unwrap_or(RequestStatus::Pending);

    let owner_id = [&["owner_id", "ownerId"][..], &["lender_id", "lenderId"][..]]
        .iter()
        .filter_map(|keys| optional_string(record, keys))
        .find(|id| !id.is_empty());

    BorrowRequest {
        id,
        id_source,
        raw_keys,
        item_id: string_or(record, &["item_id", "itemId"], ""),
        item_title: string_or(record, &["item_title", "itemTitle"], PLACEHOLDER_ITEM_TITLE),
        item_image: optional_string(record, &["item_image", "itemImage"]),
        borrower_id: string_or(record, &["borrower_id", "borrowerId"], ""),
        borrower_name: string_or(record, &["borrower_name", "borrowerName"], PLACEHOLDER_BORROWER),
        borrower_email: string_or(record, &["borrower_email", "borrowerEmail"], ""),
        borrower_rating: number_or(record, &["borrower_rating", "borrowerRating"], 0.0),
        owner_id,
        lender_name: string_or(record, &["lender_name", "lenderName"], PLACEHOLDER_LENDER),
        lender_email: optional_string(record, &["lender_email", "lenderEmail"]),
        request_date,
        preferred_date: first(record, &["preferred_date", "preferredDate"]).and_then(parse_date),
        return_date: first(record, &["return_date", "returnDate"]).and_then(parse_date),
        meeting_place: optional_string(record, &["meeting_place", "meetingPlace"]),
        meeting_time: optional_string(record, &["meeting_time", "meetingTime"])
            .map(|time| truncate_time(&time)),
        message: string_or(record, &["message", "borrower_message"], ""),
        decision_message: optional_string(
            record,
            &["decision_message", "decisionMessage", "response_message"],
        ),
        status,
        borrower_feedback: feedback(
            record,
            &["borrower_feedback_rating", "borrowerFeedbackRating"],
            &["borrower_feedback_message", "borrowerFeedbackMessage", "borrower_review"],
            &["borrower_feedback_at", "borrowerFeedbackAt"],
            request_date,
        ),
        lender_feedback: feedback(
            record,
            &["lender_feedback_rating", "lenderFeedbackRating"],
            &["lender_feedback_message", "lenderFeedbackMessage", "lender_review"],
            &["lender_feedback_at", "lenderFeedbackAt"],
            request_date,
        ),
    }
}

/// 貸出スケジュールの行を変換する
///
/// QRコードが欠けていれば `<borrower|lender>-<名前のスラッグ>-<ID>` を補う。
pub fn map_borrow_schedule(record: &Record, now: DateTime<Utc>) -> BorrowSchedule {
    let id = first(record, &["id"])
        .or_else(|| first(record, &["uuid"]))
        .map(text)
        .unwrap_or_else(|| format!("sched-{}", now.timestamp_millis()));
    let borrower_name = string_or(record, &["borrower_name", "borrowerName"], PLACEHOLDER_BORROWER);
    let lender_name = string_or(record, &["lender_name", "lenderName"], PLACEHOLDER_LENDER);

    let borrower_qr_code = optional_string(record, &["borrower_qr_code", "borrowerQRCode"])
        .map(QrCode::new)
        .unwrap_or_else(|| QrCode::derived(QrKind::Borrower, &borrower_name, &id));
    let lender_qr_code = optional_string(record, &["lender_qr_code", "lenderQRCode"])
        .map(QrCode::new)
        .unwrap_or_else(|| QrCode::derived(QrKind::Lender, &lender_name, &id));

    let status = first(record, &["status"])
        .and_then(|value| text(value).parse::<ScheduleStatus>().ok())
        .unwrap_or(ScheduleStatus::Scheduled);

    BorrowSchedule {
        request_id: optional_string(record, &["request_id", "requestId"]),
        item_id: string_or(record, &["item_id", "itemId"], ""),
        item_title: string_or(record, &["item_title", "itemTitle"], PLACEHOLDER_ITEM_TITLE),
        borrower_id: optional_string(record, &["borrower_id", "borrowerId"]),
        borrower_name,
        lender_id: optional_string(record, &["lender_id", "lenderId"]),
        lender_name,
        borrower_qr_code,
        lender_qr_code,
        start_date: first(record, &["start_date", "startDate"]).and_then(parse_date),
        end_date: first(record, &["end_date", "endDate"]).and_then(parse_date),
        meeting_place: optional_string(record, &["meeting_place", "meetingPlace"]),
        meeting_time: optional_string(record, &["meeting_time", "meetingTime"])
            .map(|time| truncate_time(&time)),
        status,
        return_ready: boolean(record, &["return_ready", "returnReady"]),
        origin: ScheduleOrigin::Persisted,
        id,
    }
}

/// 出品物の行を変換する
///
/// 貸出可否ラベルは保存値に関わらず数量から導出する。
pub fn map_item(record: &Record, now: DateTime<Utc>) -> MarketplaceItem {
    let quantity = number_or(record, &["quantity"], 1.0).floor() as i64;
    let id = first(record, &["id"])
        .or_else(|| first(record, &["uuid"]))
        .map(text)
        .unwrap_or_else(|| format!("item-{}", now.timestamp_millis()));

    MarketplaceItem {
        id,
        title: string_or(record, &["title"], PLACEHOLDER_UNTITLED),
        category: string_or(record, &["category"], "Other"),
        condition: string_or(record, &["condition"], "Good"),
        image: optional_string(record, &["image_url", "image"]),
        owner_id: optional_string(record, &["owner_id"]).filter(|id| !id.is_empty()),
        lender: LenderSummary {
            name: string_or(record, &["lender_name", "owner_name"], PLACEHOLDER_COMMUNITY_LENDER),
            rating: number_or(record, &["lender_rating"], 0.0),
            reviews: number_or(record, &["lender_reviews"], 0.0).max(0.0) as u32,
            email: optional_string(record, &["lender_email", "owner_email", "email"]),
        },
        availability: availability_label(quantity).to_string(),
        deposit: boolean(record, &["deposit", "deposit_required"]),
        campus: string_or(record, &["campus"], PLACEHOLDER_CAMPUS),
        description: string_or(record, &["description"], ""),
        created_at: first(record, &["created_at"])
            .and_then(parse_timestamp)
            .unwrap_or(now),
        quantity,
    }
}

/// 出品物の貸し手メールアドレス
pub fn lender_email_of(record: &Record) -> Option<String> {
    optional_string(record, &["lender_email", "owner_email"]).filter(|email| !email.is_empty())
}

fn record<const N: usize>(pairs: [(&str, Value); N]) -> Record {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

fn date_value(date: Option<NaiveDate>) -> Value {
    date.map(|d| Value::from(d.format("%Y-%m-%d").to_string()))
        .unwrap_or(Value::Null)
}

/// 借り手が入力するリクエスト内容
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
pub struct BorrowDraft {
    pub item_id: String,
    pub preferred_date: Option<NaiveDate>,
    #[serde(default)]
    pub return_date: Option<NaiveDate>,
    #[serde(default)]
    pub meeting_place: Option<String>,
    #[serde(default)]
    pub meeting_time: Option<String>,
    #[serde(default)]
    pub message: String,
}

/// 新規リクエストの行
pub fn new_request_record(
    item: &MarketplaceItem,
    borrower: &AuthUser,
    draft: &BorrowDraft,
    lender_email: Option<&str>,
) -> Record {
    record([
        ("item_id", json!(item.id)),
        ("item_title", json!(item.title)),
        ("item_image", json!(item.image)),
        ("borrower_id", json!(borrower.id)),
        ("borrower_name", json!(borrower.name)),
        ("borrower_email", json!(borrower.email.clone().unwrap_or_default())),
        ("borrower_rating", json!(borrower.rating)),
        ("preferred_date", date_value(draft.preferred_date)),
        ("return_date", date_value(draft.return_date)),
        ("meeting_place", json!(draft.meeting_place)),
        ("meeting_time", json!(draft.meeting_time)),
        ("message", json!(draft.message.trim())),
        ("status", json!(RequestStatus::Pending.as_str())),
        ("owner_id", json!(item.owner_id)),
        ("lender_name", json!(item.lender.name)),
        ("lender_email", json!(lender_email)),
        ("decision_message", Value::Null),
    ])
}

pub fn status_changes(status: RequestStatus) -> Record {
    record([("status", json!(status.as_str()))])
}

pub fn decision_changes(status: RequestStatus, message: Option<&str>) -> Record {
    record([
        ("status", json!(status.as_str())),
        ("decision_message", json!(message)),
    ])
}

/// 評価の更新内容（`<borrower|lender>_feedback_{rating,message,at}`）
pub fn feedback_changes(direction: RatingDirection, feedback: &Feedback) -> Record {
    let prefix = direction.column_prefix();
    let mut changes = Record::new();
    changes.insert(
        format!("{prefix}_feedback_rating"),
        json!(feedback.rating.value()),
    );
    changes.insert(format!("{prefix}_feedback_message"), json!(feedback.message));
    changes.insert(format!("{prefix}_feedback_at"), json!(feedback.at.to_rfc3339()));
    changes
}

/// 新規スケジュールの行
pub fn schedule_record(schedule: &BorrowSchedule) -> Record {
    record([
        ("id", json!(schedule.id)),
        ("request_id", json!(schedule.request_id)),
        ("item_id", json!(schedule.item_id)),
        ("item_title", json!(schedule.item_title)),
        ("borrower_id", json!(schedule.borrower_id)),
        ("borrower_name", json!(schedule.borrower_name)),
        ("lender_id", json!(schedule.lender_id)),
        ("lender_name", json!(schedule.lender_name)),
        ("borrower_qr_code", json!(schedule.borrower_qr_code.value())),
        ("lender_qr_code", json!(schedule.lender_qr_code.value())),
        ("start_date", date_value(schedule.start_date)),
        ("end_date", date_value(schedule.end_date)),
        ("meeting_place", json!(schedule.meeting_place)),
        ("meeting_time", json!(schedule.meeting_time)),
        ("status", json!(schedule.status.as_str())),
        ("return_ready", json!(schedule.return_ready)),
    ])
}

pub fn schedule_state_changes(schedule: &BorrowSchedule) -> Record {
    record([
        ("status", json!(schedule.status.as_str())),
        ("return_ready", json!(schedule.return_ready)),
    ])
}

pub fn return_qr_changes(schedule: &BorrowSchedule) -> Record {
    record([
        ("lender_qr_code", json!(schedule.lender_qr_code.value())),
        ("return_ready", json!(schedule.return_ready)),
    ])
}

pub fn quantity_changes(item: &MarketplaceItem) -> Record {
    record([
        ("quantity", json!(item.quantity)),
        ("availability", json!(item.availability)),
    ])
}

/// 貸し手が入力する出品内容
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize)]
pub struct ItemDraft {
    pub title: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub campus: Option<String>,
    /// 数値でない値も受け取り、出品時に1へ丸める
    #[serde(default)]
    pub quantity: Option<Value>,
    #[serde(default)]
    pub deposit: bool,
    #[serde(default)]
    pub image_url: Option<String>,
}

impl ItemDraft {
    pub fn quantity(&self) -> i64 {
        listing_quantity(self.quantity.as_ref().and_then(number))
    }
}

fn item_fields(draft: &ItemDraft, lender: &AuthUser) -> Record {
    let lender_name = lender
        .full_name
        .clone()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| lender.name.clone());
    record([
        ("title", json!(draft.title.trim())),
        ("category", json!(draft.category.as_deref().unwrap_or("Electronics"))),
        ("condition", json!(draft.condition.as_deref().unwrap_or("Like New"))),
        ("description", json!(draft.description.trim())),
        ("campus", json!(draft.campus.as_deref().unwrap_or(PLACEHOLDER_CAMPUS))),
        ("deposit", json!(draft.deposit)),
        ("image_url", json!(draft.image_url)),
        ("quantity", json!(draft.quantity())),
        ("availability", json!(availability_label(draft.quantity()))),
        ("lender_name", json!(lender_name)),
        ("lender_rating", json!(lender.rating)),
        ("lender_email", json!(lender.email)),
    ])
}

/// 新規出品の行
pub fn new_item_record(draft: &ItemDraft, lender: &AuthUser) -> Record {
    let mut row = item_fields(draft, lender);
    row.insert("owner_id".to_string(), json!(lender.id));
    row.insert("lender_reviews".to_string(), json!(0));
    row
}

/// 出品の編集内容（所有者は変えない）
pub fn item_changes(draft: &ItemDraft, lender: &AuthUser) -> Record {
    item_fields(draft, lender)
}

/// IDの型を保ったフィルタ値（数値として解釈できれば数値）
pub fn id_value(id: &str) -> Value {
    id.trim()
        .parse::<i64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::from(id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::KeyColumn;

    fn row(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_request_id_provenance() {
        let now = Utc::now();
        let by_id = map_borrow_request(&row(json!({"id": 7, "uuid": "u-1"})), now);
        assert_eq!((by_id.id.as_str(), by_id.id_source), ("7", IdSource::Id));
        assert_eq!(by_id.primary_key(), (KeyColumn::Id, json!(7)));

        let by_request_id = map_borrow_request(&row(json!({"request_id": "r-9", "uuid": "u-1"})), now);
        assert_eq!(by_request_id.id, "r-9");
        assert_eq!(by_request_id.id_source, IdSource::RequestId);

        let by_uuid = map_borrow_request(&row(json!({"id": "", "uuid": "u-1"})), now);
        assert_eq!(by_uuid.id_source, IdSource::Uuid);

        let generated = map_borrow_request(&row(json!({})), now);
        assert_eq!(generated.id, format!("req-{}", now.timestamp_millis()));
        assert_eq!(generated.id_source, IdSource::Generated);
    }

    #[test]
    fn test_request_defaults_and_aliases() {
        let now = Utc::now();
        let mapped = map_borrow_request(
            &row(json!({
                "id": 1,
                "itemId": "i1",
                "lender_id": "l1",
                "borrower_message": "Need it for finals",
                "response_message": "See you then",
                "meeting_time": "14:00:00",
                "preferred_date": "2025-10-20T00:00:00Z",
                "status": "approved",
                "lender_review": "Careful borrower",
                "lender_feedback_rating": 5
            })),
            now,
        );
        assert_eq!(mapped.item_id, "i1");
        assert_eq!(mapped.item_title, "Borrowed Item");
        assert_eq!(mapped.borrower_name, "Borrower");
        assert_eq!(mapped.lender_name, "Lender");
        assert_eq!(mapped.owner_id.as_deref(), Some("l1"));
        assert_eq!(mapped.message, "Need it for finals");
        assert_eq!(mapped.decision_message.as_deref(), Some("See you then"));
        assert_eq!(mapped.meeting_time.as_deref(), Some("14:00"));
        assert_eq!(mapped.preferred_date, NaiveDate::from_ymd_opt(2025, 10, 20));
        assert_eq!(mapped.status, RequestStatus::Approved);
        assert_eq!(mapped.request_date, now);
        let feedback = mapped.lender_feedback.unwrap();
        assert_eq!(feedback.rating.value(), 5);
        assert_eq!(feedback.message.as_deref(), Some("Careful borrower"));
        assert!(mapped.borrower_feedback.is_none());
    }

    #[test]
    fn test_request_date_prefers_created_at() {
        let mapped = map_borrow_request(
            &row(json!({
                "id": 1,
                "created_at": "2025-10-01T08:00:00+00:00",
                "request_date": "2025-09-01"
            })),
            Utc::now(),
        );
        assert_eq!(mapped.request_date.to_rfc3339(), "2025-10-01T08:00:00+00:00");
    }

    #[test]
    fn test_zero_rating_is_not_feedback() {
        let mapped = map_borrow_request(
            &row(json!({"id": 1, "borrower_feedback_rating": 0})),
            Utc::now(),
        );
        assert!(mapped.borrower_feedback.is_none());
    }

    #[test]
    fn test_schedule_defaults() {
        let mapped = map_borrow_schedule(
            &row(json!({
                "id": 12,
                "borrower_name": "Alex Johnson",
                "start_date": "2025-10-20T09:30:00Z",
                "end_date": "not a date",
                "status": "overdue",
                "return_ready": "true"
            })),
            Utc::now(),
        );
        assert_eq!(mapped.id, "12");
        assert_eq!(mapped.borrower_qr_code.value(), "borrower-alex-johnson-12");
        assert_eq!(mapped.lender_qr_code.value(), "lender-lender-12");
        assert_eq!(mapped.start_date, NaiveDate::from_ymd_opt(2025, 10, 20));
        assert_eq!(mapped.end_date, None);
        assert_eq!(mapped.status, ScheduleStatus::Borrowed);
        assert!(mapped.return_ready);
        assert_eq!(mapped.item_title, "Borrowed Item");
    }

    #[test]
    fn test_item_defaults_and_availability() {
        let now = Utc::now();
        let item = map_item(&row(json!({"id": 3, "quantity": "0", "availability": "Available"})), now);
        assert_eq!(item.title, "Untitled Item");
        assert_eq!(item.category, "Other");
        assert_eq!(item.condition, "Good");
        assert_eq!(item.campus, "Main Campus");
        assert_eq!(item.lender.name, "Community Lender");
        assert_eq!(item.quantity, 0);
        assert_eq!(item.availability, "Unavailable");

        let defaulted = map_item(&row(json!({"id": 4})), now);
        assert_eq!(defaulted.quantity, 1);
        assert_eq!(defaulted.availability, "Available");
    }

    #[test]
    fn test_feedback_changes_columns() {
        let feedback = Feedback {
            rating: StarRating::try_from(4i64).unwrap(),
            message: None,
            at: Utc::now(),
        };
        let changes = feedback_changes(RatingDirection::BorrowerToLender, &feedback);
        assert_eq!(changes.get("borrower_feedback_rating"), Some(&json!(4)));
        assert_eq!(changes.get("borrower_feedback_message"), Some(&Value::Null));
        assert!(changes.contains_key("borrower_feedback_at"));
    }

    #[test]
    fn test_id_value_keeps_numeric_type() {
        assert_eq!(id_value("42"), json!(42));
        assert_eq!(id_value("abc"), json!("abc"));
    }
}
