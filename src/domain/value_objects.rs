use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::RatingError;

/// 貸出リクエストIDの出所
///
/// 永続化ストアは主キーを複数の列名で公開することがあるため、
/// どの列から値を取得したかを記録しておく。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdSource {
    Id,
    Uuid,
    RequestId,
    /// どの候補列にも値がなく、ローカルで生成したID
    Generated,
}

impl IdSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdSource::Id => "id",
            IdSource::Uuid => "uuid",
            IdSource::RequestId => "request_id",
            IdSource::Generated => "generated",
        }
    }

    /// 更新時にフィルタとして使う列
    ///
    /// 生成IDは永続化された列を持たないため `id` にフォールバックする。
    pub fn key_column(&self) -> KeyColumn {
        match self {
            IdSource::Uuid => KeyColumn::Uuid,
            IdSource::RequestId => KeyColumn::RequestId,
            IdSource::Id | IdSource::Generated => KeyColumn::Id,
        }
    }
}

/// 識別子の候補列
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyColumn {
    Id,
    Uuid,
    RequestId,
}

impl KeyColumn {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyColumn::Id => "id",
            KeyColumn::Uuid => "uuid",
            KeyColumn::RequestId => "request_id",
        }
    }
}

/// 永続化されたままの生キー値
///
/// 数値列と文字列列の区別を保持し、後の識別子解決で型を変えて再試行できるようにする。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawKey {
    Number(i64),
    Text(String),
}

impl RawKey {
    /// 文字列表現（ローカルIDとの比較用）
    pub fn as_text(&self) -> String {
        match self {
            RawKey::Number(n) => n.to_string(),
            RawKey::Text(s) => s.clone(),
        }
    }

    /// 数値として解釈できる場合はその値
    pub fn as_number(&self) -> Option<i64> {
        match self {
            RawKey::Number(n) => Some(*n),
            RawKey::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            RawKey::Number(n) => serde_json::Value::from(*n),
            RawKey::Text(s) => serde_json::Value::from(s.clone()),
        }
    }
}

/// 候補列ごとの生キー値
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawKeys {
    pub id: Option<RawKey>,
    pub uuid: Option<String>,
    pub request_id: Option<RawKey>,
}

impl RawKeys {
    /// いずれかの生キーが指定のIDと一致するか
    pub fn matches(&self, id: &str) -> bool {
        self.id.as_ref().is_some_and(|k| k.as_text() == id)
            || self.uuid.as_deref().is_some_and(|u| u == id)
            || self.request_id.as_ref().is_some_and(|k| k.as_text() == id)
    }

    /// 既知のすべての識別子文字列
    pub fn texts(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(id) = &self.id {
            out.push(id.as_text());
        }
        if let Some(uuid) = &self.uuid {
            out.push(uuid.clone());
        }
        if let Some(request_id) = &self.request_id {
            out.push(request_id.as_text());
        }
        out
    }
}

/// QRコードの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QrKind {
    /// 借り手が提示する受け渡し用コード
    Borrower,
    /// 貸し手が提示する返却用コード
    Lender,
}

impl QrKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            QrKind::Borrower => "borrower",
            QrKind::Lender => "lender",
        }
    }
}

/// QRコード
///
/// 不透明なトークン。意味を持つのは同一性のみで、
/// スキャンされた文字列との完全一致が唯一の認可チェックとなる。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QrCode(String);

impl QrCode {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// 新しい一意なコードを発行する
    pub fn issue(kind: QrKind, holder_name: &str, issued_at: DateTime<Utc>) -> Self {
        let nonce = Uuid::new_v4().simple().to_string();
        Self(format!(
            "{}-{}-{}-{}",
            kind.prefix(),
            slugify(holder_name),
            issued_at.timestamp_millis(),
            &nonce[..8]
        ))
    }

    /// 永続化されていないコードの既定値（`<kind>-<slug>-<suffix>`）
    pub fn derived(kind: QrKind, holder_name: &str, suffix: &str) -> Self {
        Self(format!("{}-{}-{}", kind.prefix(), slugify(holder_name), suffix))
    }

    pub fn value(&self) -> &str {
        &self.0
    }

    /// スキャン結果と完全一致するか
    pub fn matches(&self, scanned: &str) -> bool {
        self.0 == scanned
    }
}

/// 名前をQRコード用のスラッグに変換する
pub fn slugify(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase()
}

/// 星評価
///
/// 不変条件：1〜5の整数。型で制約し、0や6以上の値を作れないようにする。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u8")]
pub struct StarRating(u8);

impl StarRating {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 5;

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for StarRating {
    type Error = RatingError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        if value < i64::from(Self::MIN) || value > i64::from(Self::MAX) {
            return Err(RatingError::OutOfRange(value));
        }
        Ok(Self(value as u8))
    }
}

impl TryFrom<u8> for StarRating {
    type Error = RatingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::try_from(i64::from(value))
    }
}

impl From<StarRating> for u8 {
    fn from(rating: StarRating) -> Self {
        rating.0
    }
}

/// 現在のユーザー（外部の認証セッションから渡される）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    pub name: String,
    pub full_name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    /// プロフィール上の平均評価
    #[serde(default)]
    pub rating: f64,
}

impl AuthUser {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// 名前照合に使う正規化済みトークン
    pub fn name_tokens(&self) -> Vec<String> {
        let mut tokens: Vec<String> = Vec::new();
        let mut add = |value: Option<&str>| {
            let normalized = normalize_name(value.unwrap_or_default());
            if !normalized.is_empty() && !tokens.contains(&normalized) {
                tokens.push(normalized);
            }
        };
        add(Some(&self.name));
        add(self.full_name.as_deref());
        if let (Some(first), Some(last)) = (&self.first_name, &self.last_name) {
            add(Some(&format!("{first} {last}")));
        }
        tokens
    }

    /// IDまたは名前で本人かどうかを判定する
    ///
    /// IDが両方そろっている場合はIDのみで判定し、ない場合に限り名前で照合する。
    pub fn matches(&self, candidate_id: Option<&str>, candidate_name: &str) -> bool {
        let own_id = self.id.trim();
        if let Some(candidate_id) = candidate_id.map(str::trim).filter(|id| !id.is_empty()) {
            if !own_id.is_empty() {
                return candidate_id == own_id;
            }
        }
        let normalized = normalize_name(candidate_name);
        !normalized.is_empty() && self.name_tokens().contains(&normalized)
    }
}

/// 名前の比較用正規化（前後の空白除去と小文字化）
pub fn normalize_name(value: &str) -> String {
    value.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_star_rating_accepts_one_to_five() {
        for value in 1..=5i64 {
            let rating = StarRating::try_from(value).unwrap();
            assert_eq!(i64::from(rating.value()), value);
        }
    }

    #[test]
    fn test_star_rating_rejects_zero_and_six() {
        assert_eq!(StarRating::try_from(0i64), Err(RatingError::OutOfRange(0)));
        assert_eq!(StarRating::try_from(6i64), Err(RatingError::OutOfRange(6)));
        assert!(StarRating::try_from(-1i64).is_err());
    }

    #[test]
    fn test_slugify_collapses_whitespace() {
        assert_eq!(slugify("  Alex   Johnson "), "alex-johnson");
        assert_eq!(slugify("B1"), "b1");
    }

    #[test]
    fn test_qr_code_issue_is_unique_and_prefixed() {
        let now = Utc::now();
        let a = QrCode::issue(QrKind::Borrower, "Alex Johnson", now);
        let b = QrCode::issue(QrKind::Borrower, "Alex Johnson", now);
        assert!(a.value().starts_with("borrower-alex-johnson-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_qr_code_matches_exactly() {
        let code = QrCode::new("lender-l1-42");
        assert!(code.matches("lender-l1-42"));
        assert!(!code.matches("lender-l1-42 "));
        assert!(!code.matches("LENDER-L1-42"));
    }

    #[test]
    fn test_raw_keys_match_any_column() {
        let keys = RawKeys {
            id: Some(RawKey::Number(42)),
            uuid: Some("7d1c1c0e-3f7a-4e4b-9a55-0d9c9b2f3b11".to_string()),
            request_id: None,
        };
        assert!(keys.matches("42"));
        assert!(keys.matches("7d1c1c0e-3f7a-4e4b-9a55-0d9c9b2f3b11"));
        assert!(!keys.matches("43"));
    }

    #[test]
    fn test_auth_user_matches_by_id_before_name() {
        let user = AuthUser::new("u-1", "Alex Johnson");
        assert!(user.matches(Some("u-1"), "Someone Else"));
        assert!(!user.matches(Some("u-2"), "Alex Johnson"));
        assert!(user.matches(None, "  alex johnson "));
        assert!(!user.matches(Some(""), ""));
    }
}
