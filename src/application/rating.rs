use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::domain::dashboard::{RatingStats, calculate_rating_stats, round_rating};
use crate::domain::{
    BorrowRequest, Feedback, IdentifierCandidate, RatingContext, StarRating, apply_feedback,
    identifier_candidates,
};
use crate::ports::{Filter, Query, Record, StoreError, Table};

use super::errors::{LendingError, Result};
use super::mapper;
use super::ServiceDependencies;

const SUBMIT_FAILED: &str = "Failed to submit rating. Please try again.";

/// 評価の送信を担う
///
/// 行の識別子が揺れていても、候補を順に試して1行だけを更新する。
pub struct RatingCoordinator {
    deps: ServiceDependencies,
}

impl RatingCoordinator {
    pub fn new(deps: ServiceDependencies) -> Self {
        Self { deps }
    }

    /// 評価を送信し、確認済みのリクエストを返す
    ///
    /// ビジネスルール：
    /// - 評価は1〜5（範囲外はリモートを呼ばずに拒否）
    /// - 候補を順に更新し、行が返った時点で終了（存在しない列は次の候補へ）
    /// - どの更新も行を返さず、エラーもなければ再取得して確認する
    /// - 更新エラーがあり行が返らなければ送信失敗（ローカルは変更しない）
    /// - 確認できなければ「再読み込みして再試行」エラー
    /// - 同じ方向の再送信は同じ行を上書きする
    pub async fn submit(
        &self,
        context: &RatingContext,
        rating: i64,
        review: &str,
        now: DateTime<Utc>,
    ) -> Result<BorrowRequest> {
        let rating = StarRating::try_from(rating)?;
        let trimmed = review.trim();
        let feedback = Feedback {
            rating,
            message: (!trimmed.is_empty()).then(|| trimmed.to_string()),
            at: now,
        };
        let changes = mapper::feedback_changes(context.direction, &feedback);

        let candidates = identifier_candidates(context);
        if candidates.is_empty() {
            return Err(LendingError::Unresolved);
        }

        let mut last_error: Option<StoreError> = None;
        let mut confirmed: Option<Record> = None;

        for candidate in &candidates {
            let filter = Filter::eq(candidate.column.as_str(), candidate.value.to_json());
            match self
                .deps
                .table_store
                .update(Table::BorrowRequests, filter, changes.clone(), Some(1))
                .await
            {
                Ok(rows) => {
                    if let Some(row) = rows.into_iter().next() {
                        confirmed = Some(row);
                        break;
                    }
                }
                Err(e) if e.is_missing_column() => {
                    tracing::debug!(column = candidate.column.as_str(), "Skipping missing identifier column");
                }
                Err(e) => {
                    tracing::warn!(
                        request_id = %context.request_id,
                        column = candidate.column.as_str(),
                        error = %e,
                        "Rating update attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        // 更新が失敗した場合は再取得で成功扱いにしない
        if confirmed.is_none() && last_error.is_none() {
            confirmed = self.refetch(&candidates, &mut last_error).await;
        }

        let Some(row) = confirmed else {
            return Err(match last_error {
                Some(e) => {
                    tracing::error!(request_id = %context.request_id, error = %e, "Failed to submit rating");
                    LendingError::remote(SUBMIT_FAILED, e)
                }
                None => LendingError::Unresolved,
            });
        };

        let mut mapped = mapper::map_borrow_request(&row, now);
        if context.direction.feedback_of(&mapped).is_none() {
            mapped = apply_feedback(&mapped, context.direction, rating, trimmed, now);
        }
        tracing::info!(
            request_id = %mapped.id,
            direction = context.direction.column_prefix(),
            rating = rating.value(),
            "Rating submitted"
        );
        Ok(mapped)
    }

    async fn refetch(
        &self,
        candidates: &[IdentifierCandidate],
        last_error: &mut Option<StoreError>,
    ) -> Option<Record> {
        for candidate in candidates {
            let query = Query::new()
                .filter(Filter::eq(candidate.column.as_str(), candidate.value.to_json()))
                .limit(1);
            match self
                .deps
                .table_store
                .select(Table::BorrowRequests, query)
                .await
            {
                Ok(rows) => {
                    if let Some(row) = rows.into_iter().next() {
                        return Some(row);
                    }
                }
                Err(e) if e.is_missing_column() => {}
                Err(e) => *last_error = Some(e),
            }
        }
        None
    }

    /// 評価されたユーザーの取引を読み直し、プロフィールの平均評価を更新する
    pub async fn refresh_profile_rating(&self, user_id: &str) {
        if user_id.is_empty() {
            return;
        }
        let query = Query::new().filter(super::request_store::participant_filter(user_id));
        let rows = match self
            .deps
            .table_store
            .select(Table::BorrowRequests, query)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(user_id = %user_id, error = %e, "Failed to load requests for profile rating");
                return;
            }
        };
        let now = Utc::now();
        let requests: Vec<BorrowRequest> = rows
            .iter()
            .map(|row| mapper::map_borrow_request(row, now))
            .collect();
        let stats = calculate_rating_stats(&requests, user_id);
        self.sync_profile_rating(user_id, &stats).await;
    }

    /// プロフィールの平均評価を同期する（ベストエフォート）
    pub async fn sync_profile_rating(&self, user_id: &str, stats: &RatingStats) {
        if user_id.is_empty() {
            return;
        }
        let rating = match stats.overall_average {
            Some(average) if stats.total_count > 0 => Value::from(round_rating(average)),
            _ => Value::Null,
        };
        let mut changes = Record::new();
        changes.insert("rating".to_string(), rating);

        if let Err(e) = self
            .deps
            .table_store
            .update(Table::Profiles, Filter::eq("id", user_id), changes, Some(1))
            .await
        {
            tracing::error!(user_id = %user_id, error = %e, "Failed to sync profile rating");
        }
    }
}
