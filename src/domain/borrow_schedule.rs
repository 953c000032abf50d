use std::collections::{HashMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    AuthUser, BorrowRequest, ItemHandedOff, ItemReturned, QrCode, QrKind, RequestStatus,
    ReturnQrIssued, ScanError, ScheduleArranged, ScheduleError, ScheduleEvent,
};

/// 永続化されるスケジュールのステータス
///
/// `overdue` は保存されない。表示時に終了日と当日から導出する。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Scheduled,
    AwaitingHandoff,
    Borrowed,
    Completed,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Scheduled => "scheduled",
            ScheduleStatus::AwaitingHandoff => "awaiting_handoff",
            ScheduleStatus::Borrowed => "borrowed",
            ScheduleStatus::Completed => "completed",
        }
    }
}

impl std::str::FromStr for ScheduleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "scheduled" => Ok(ScheduleStatus::Scheduled),
            "awaiting_handoff" => Ok(ScheduleStatus::AwaitingHandoff),
            // 旧データでは延滞が保存されていることがある
            "borrowed" | "overdue" => Ok(ScheduleStatus::Borrowed),
            "completed" => Ok(ScheduleStatus::Completed),
            _ => Err(format!("Invalid schedule status: {}", s)),
        }
    }
}

/// 表示用ステータス（導出された延滞を含む）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayStatus {
    Scheduled,
    AwaitingHandoff,
    Borrowed,
    Overdue,
    Completed,
}

/// 純粋関数：表示用ステータスを導出する
///
/// ビジネスルール：
/// - 受け渡し待ち・貸出中のみ延滞になりうる
/// - 終了日が当日より前なら延滞（当日中はまだ延滞ではない）
/// - 終了日がなければ延滞にならない
pub fn display_status(
    status: ScheduleStatus,
    end_date: Option<NaiveDate>,
    today: NaiveDate,
) -> DisplayStatus {
    let can_be_overdue = matches!(
        status,
        ScheduleStatus::AwaitingHandoff | ScheduleStatus::Borrowed
    );
    if can_be_overdue && end_date.is_some_and(|end| end < today) {
        return DisplayStatus::Overdue;
    }
    match status {
        ScheduleStatus::Scheduled => DisplayStatus::Scheduled,
        ScheduleStatus::AwaitingHandoff => DisplayStatus::AwaitingHandoff,
        ScheduleStatus::Borrowed => DisplayStatus::Borrowed,
        ScheduleStatus::Completed => DisplayStatus::Completed,
    }
}

/// スケジュールに対する閲覧者の役割
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Borrower,
    Lender,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Borrower => "borrower",
            Role::Lender => "lender",
        }
    }
}

/// スキャンの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanKind {
    /// 貸し手が借り手のQRを読み取る
    Handoff,
    /// 借り手が貸し手の返却用QRを読み取る
    Return,
}

impl ScanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanKind::Handoff => "handoff",
            ScanKind::Return => "return",
        }
    }

    /// このスキャンを行う役割
    pub fn scanner(&self) -> Role {
        match self {
            ScanKind::Handoff => Role::Lender,
            ScanKind::Return => Role::Borrower,
        }
    }
}

/// スケジュールの出所
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleOrigin {
    Persisted,
    /// 承認済みでスケジュール未作成のリクエストから合成したもの
    Placeholder,
}

/// 貸出スケジュール - 受け渡しから返却までの1サイクル
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BorrowSchedule {
    pub id: String,
    pub request_id: Option<String>,

    pub item_id: String,
    pub item_title: String,

    pub borrower_id: Option<String>,
    pub borrower_name: String,
    pub lender_id: Option<String>,
    pub lender_name: String,

    /// 受け渡し確認用
    pub borrower_qr_code: QrCode,
    /// 返却確認用
    pub lender_qr_code: QrCode,

    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub meeting_place: Option<String>,
    pub meeting_time: Option<String>,

    pub status: ScheduleStatus,
    pub return_ready: bool,
    pub origin: ScheduleOrigin,
}

impl BorrowSchedule {
    pub fn display_status(&self, today: NaiveDate) -> DisplayStatus {
        display_status(self.status, self.end_date, today)
    }

    pub fn is_placeholder(&self) -> bool {
        self.origin == ScheduleOrigin::Placeholder
    }

    /// 閲覧者の役割（当事者でなければ `None`）
    pub fn role_of(&self, viewer: &AuthUser) -> Option<Role> {
        if viewer.matches(self.lender_id.as_deref(), &self.lender_name) {
            Some(Role::Lender)
        } else if viewer.matches(self.borrower_id.as_deref(), &self.borrower_name) {
            Some(Role::Borrower)
        } else {
            None
        }
    }
}

/// 貸し手が入力する受け渡しの詳細
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleDraft {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub meeting_place: String,
    pub meeting_time: String,
}

/// 純粋関数：受け渡しの入力を検証する
pub fn validate_draft(draft: &ScheduleDraft) -> Result<(NaiveDate, NaiveDate), ScheduleError> {
    let (Some(start), Some(end)) = (draft.start_date, draft.end_date) else {
        return Err(ScheduleError::MissingDates);
    };
    if end < start {
        return Err(ScheduleError::EndBeforeStart);
    }
    if draft.meeting_place.trim().is_empty() {
        return Err(ScheduleError::MissingMeetingPlace);
    }
    if draft.meeting_time.trim().is_empty() {
        return Err(ScheduleError::MissingMeetingTime);
    }
    Ok((start, end))
}

/// 純粋関数：承認済みリクエストから仮スケジュールを合成する
///
/// IDは `request-<リクエストID>`。開始日は希望日、終了日は返却日（なければ希望日）。
pub fn placeholder(request: &BorrowRequest) -> BorrowSchedule {
    let id = format!("request-{}", request.id);
    BorrowSchedule {
        request_id: Some(request.id.clone()),
        item_id: request.item_id.clone(),
        item_title: request.item_title.clone(),
        borrower_id: Some(request.borrower_id.clone()).filter(|id| !id.is_empty()),
        borrower_name: request.borrower_name.clone(),
        lender_id: request.owner_id.clone().filter(|id| !id.is_empty()),
        lender_name: request.lender_name.clone(),
        borrower_qr_code: QrCode::derived(QrKind::Borrower, &request.borrower_name, &id),
        lender_qr_code: QrCode::derived(QrKind::Lender, &request.lender_name, &id),
        start_date: request.preferred_date,
        end_date: request.return_date.or(request.preferred_date),
        meeting_place: request.meeting_place.clone(),
        meeting_time: request.meeting_time.clone(),
        status: ScheduleStatus::Scheduled,
        return_ready: false,
        origin: ScheduleOrigin::Placeholder,
        id,
    }
}

/// 純粋関数：受け渡しを手配する
///
/// ビジネスルール：
/// - 手配できるのは貸し手のみ
/// - 承認済みのリクエストのみ
/// - 日付・場所・時刻の入力が必須、終了日は開始日以降
/// - 新しいスケジュールは受け渡し待ちで、両方のQRコードを新規発行する
///
/// 副作用なし。新しいスケジュールとイベントを返す。
pub fn arrange(
    request: &BorrowRequest,
    viewer: &AuthUser,
    draft: &ScheduleDraft,
    arranged_at: DateTime<Utc>,
) -> Result<(BorrowSchedule, ScheduleArranged), ScheduleError> {
    if !viewer.matches(request.owner_id.as_deref(), &request.lender_name) {
        return Err(ScheduleError::NotPermitted {
            required: Role::Lender,
        });
    }
    if request.status != RequestStatus::Approved {
        return Err(ScheduleError::RequestNotApproved);
    }
    let (start, end) = validate_draft(draft)?;

    let schedule = BorrowSchedule {
        id: Uuid::new_v4().to_string(),
        request_id: Some(request.id.clone()),
        item_id: request.item_id.clone(),
        item_title: request.item_title.clone(),
        borrower_id: Some(request.borrower_id.clone()).filter(|id| !id.is_empty()),
        borrower_name: request.borrower_name.clone(),
        lender_id: request.owner_id.clone().filter(|id| !id.is_empty()),
        lender_name: request.lender_name.clone(),
        borrower_qr_code: QrCode::issue(QrKind::Borrower, &request.borrower_name, arranged_at),
        lender_qr_code: QrCode::issue(QrKind::Lender, &request.lender_name, arranged_at),
        start_date: Some(start),
        end_date: Some(end),
        meeting_place: Some(draft.meeting_place.trim().to_string()),
        meeting_time: Some(truncate_time(draft.meeting_time.trim())),
        status: ScheduleStatus::AwaitingHandoff,
        return_ready: false,
        origin: ScheduleOrigin::Persisted,
    };

    let event = ScheduleArranged {
        schedule_id: schedule.id.clone(),
        request_id: request.id.clone(),
        item_id: schedule.item_id.clone(),
        start_date: start,
        end_date: end,
        arranged_at,
    };

    Ok((schedule, event))
}

/// 純粋関数：借り手が受け渡し用QRを提示する
pub fn present_handoff_qr(
    schedule: &BorrowSchedule,
    viewer: &AuthUser,
) -> Result<QrCode, ScheduleError> {
    if schedule.role_of(viewer) != Some(Role::Borrower) {
        return Err(ScheduleError::NotPermitted {
            required: Role::Borrower,
        });
    }
    if schedule.status != ScheduleStatus::AwaitingHandoff {
        return Err(ScheduleError::InvalidState {
            status: schedule.status,
        });
    }
    Ok(schedule.borrower_qr_code.clone())
}

/// 純粋関数：貸し手が返却用QRを発行する
///
/// ビジネスルール：
/// - 貸し手のみ、貸出中のみ
/// - 新しいコードを発行し `return_ready` を立てる
pub fn generate_return_qr(
    schedule: &BorrowSchedule,
    viewer: &AuthUser,
    issued_at: DateTime<Utc>,
) -> Result<(BorrowSchedule, ReturnQrIssued), ScheduleError> {
    if schedule.role_of(viewer) != Some(Role::Lender) {
        return Err(ScheduleError::NotPermitted {
            required: Role::Lender,
        });
    }
    if schedule.status != ScheduleStatus::Borrowed {
        return Err(ScheduleError::InvalidState {
            status: schedule.status,
        });
    }

    let updated = BorrowSchedule {
        lender_qr_code: QrCode::issue(QrKind::Lender, &schedule.lender_name, issued_at),
        return_ready: true,
        ..schedule.clone()
    };

    let event = ReturnQrIssued {
        schedule_id: schedule.id.clone(),
        issued_at,
    };

    Ok((updated, event))
}

/// 純粋関数：スキャン結果を検証して状態を進める
///
/// ビジネスルール：
/// - 受け渡し：貸し手が受け渡し待ちの間に借り手のQRを読み取る → 貸出中
/// - 返却：借り手が返却準備済みの貸出中に貸し手のQRを読み取る → 完了
/// - 文字列の完全一致のみ受け付ける。失敗時はスケジュールを変更しない
pub fn scan(
    schedule: &BorrowSchedule,
    viewer: &AuthUser,
    kind: ScanKind,
    payload: &str,
    scanned_at: DateTime<Utc>,
) -> Result<(BorrowSchedule, ScheduleEvent), ScanError> {
    let required = kind.scanner();
    if schedule.role_of(viewer) != Some(required) {
        return Err(ScanError::WrongRole { required });
    }

    match kind {
        ScanKind::Handoff => {
            if schedule.status != ScheduleStatus::AwaitingHandoff {
                return Err(ScanError::NotReady { kind });
            }
            if !schedule.borrower_qr_code.matches(payload) {
                return Err(ScanError::Mismatch(kind));
            }
            let updated = BorrowSchedule {
                status: ScheduleStatus::Borrowed,
                return_ready: false,
                ..schedule.clone()
            };
            let event = ScheduleEvent::HandedOff(ItemHandedOff {
                schedule_id: schedule.id.clone(),
                request_id: schedule.request_id.clone(),
                item_id: schedule.item_id.clone(),
                handed_off_at: scanned_at,
            });
            Ok((updated, event))
        }
        ScanKind::Return => {
            if schedule.status != ScheduleStatus::Borrowed || !schedule.return_ready {
                return Err(ScanError::NotReady { kind });
            }
            if !schedule.lender_qr_code.matches(payload) {
                return Err(ScanError::Mismatch(kind));
            }
            Ok(complete(schedule, scanned_at, false))
        }
    }
}

/// 純粋関数：貸し手が手動で返却完了にする
///
/// 返却スキャンと同じ結果になる。
pub fn mark_complete(
    schedule: &BorrowSchedule,
    viewer: &AuthUser,
    completed_at: DateTime<Utc>,
) -> Result<(BorrowSchedule, ScheduleEvent), ScheduleError> {
    if schedule.role_of(viewer) != Some(Role::Lender) {
        return Err(ScheduleError::NotPermitted {
            required: Role::Lender,
        });
    }
    if schedule.status != ScheduleStatus::Borrowed {
        return Err(ScheduleError::InvalidState {
            status: schedule.status,
        });
    }
    Ok(complete(schedule, completed_at, true))
}

fn complete(
    schedule: &BorrowSchedule,
    returned_at: DateTime<Utc>,
    manual: bool,
) -> (BorrowSchedule, ScheduleEvent) {
    let updated = BorrowSchedule {
        status: ScheduleStatus::Completed,
        return_ready: false,
        ..schedule.clone()
    };
    let event = ScheduleEvent::Returned(ItemReturned {
        schedule_id: schedule.id.clone(),
        request_id: schedule.request_id.clone(),
        item_id: schedule.item_id.clone(),
        returned_at,
        manual,
    });
    (updated, event)
}

/// 純粋関数：スケジュールからリクエストの実効ステータスを導出する
///
/// 貸出中 → ongoing、完了 → completed。それ以外は上書きしない。
pub fn request_stage_overrides(schedules: &[BorrowSchedule]) -> HashMap<String, RequestStatus> {
    let mut overrides = HashMap::new();
    for schedule in schedules {
        let Some(request_id) = &schedule.request_id else {
            continue;
        };
        match schedule.status {
            ScheduleStatus::Borrowed => {
                overrides.insert(request_id.clone(), RequestStatus::Ongoing);
            }
            ScheduleStatus::Completed => {
                overrides.insert(request_id.clone(), RequestStatus::Completed);
            }
            _ => {}
        }
    }
    overrides
}

/// 純粋関数：表示用のスケジュール一覧を組み立てる
///
/// - 永続化済みのスケジュールはすべて含める（ID重複は除く）
/// - 承認済みでスケジュールに参照されていないリクエストには仮スケジュールを追加
/// - 開始日の降順。開始日なしは最古として扱う
pub fn schedule_cards(
    schedules: &[BorrowSchedule],
    requests: &[BorrowRequest],
) -> Vec<BorrowSchedule> {
    let mut seen = HashSet::new();
    let mut cards: Vec<BorrowSchedule> = schedules
        .iter()
        .filter(|schedule| seen.insert(schedule.id.clone()))
        .cloned()
        .collect();

    let referenced: Vec<&str> = schedules
        .iter()
        .filter_map(|schedule| schedule.request_id.as_deref())
        .collect();

    for request in requests {
        if request.status != RequestStatus::Approved {
            continue;
        }
        if referenced.iter().any(|id| request.is_identified_by(id)) {
            continue;
        }
        let card = placeholder(request);
        if seen.insert(card.id.clone()) {
            cards.push(card);
        }
    }

    cards.sort_by(|a, b| {
        let a = a.start_date.unwrap_or_default();
        let b = b.start_date.unwrap_or_default();
        b.cmp(&a)
    });
    cards
}

/// 時刻を `HH:MM` に切り詰める
pub fn truncate_time(value: &str) -> String {
    value.chars().take(5).collect()
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn schedule(id: &str, status: ScheduleStatus) -> BorrowSchedule {
        BorrowSchedule {
            id: id.to_string(),
            request_id: Some("1".to_string()),
            item_id: "i1".to_string(),
            item_title: "Graphing Calculator".to_string(),
            borrower_id: Some("b1".to_string()),
            borrower_name: "Borrower One".to_string(),
            lender_id: Some("l1".to_string()),
            lender_name: "Lender One".to_string(),
            borrower_qr_code: QrCode::new("borrower-code"),
            lender_qr_code: QrCode::new("lender-code"),
            start_date: NaiveDate::from_ymd_opt(2025, 10, 20),
            end_date: NaiveDate::from_ymd_opt(2025, 10, 27),
            meeting_place: Some("Library Atrium".to_string()),
            meeting_time: Some("14:00".to_string()),
            status,
            return_ready: false,
            origin: ScheduleOrigin::Persisted,
        }
    }
}
