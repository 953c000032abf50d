use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AuthUser, BorrowRequest, RequestStatus, count_pending, normalize_name};

/// 最近のアクティビティの最大件数
pub const RECENT_ACTIVITY_LIMIT: usize = 6;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleRatingStats {
    pub average: Option<f64>,
    pub count: usize,
}

/// 受け取った評価の集計
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RatingStats {
    /// 貸し手として受けた評価（借り手 → 貸し手）
    pub as_lender: RoleRatingStats,
    /// 借り手として受けた評価（貸し手 → 借り手）
    pub as_borrower: RoleRatingStats,
    pub overall_average: Option<f64>,
    pub total_count: usize,
}

fn average(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// 小数点以下2桁に丸める
pub fn round_rating(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// 純粋関数：ユーザーが受け取った評価を集計する
pub fn calculate_rating_stats(requests: &[BorrowRequest], user_id: &str) -> RatingStats {
    if user_id.is_empty() {
        return RatingStats::default();
    }

    let as_lender: Vec<f64> = requests
        .iter()
        .filter(|req| req.is_owner(user_id))
        .filter_map(|req| req.borrower_feedback.as_ref())
        .map(|feedback| f64::from(feedback.rating.value()))
        .collect();
    let as_borrower: Vec<f64> = requests
        .iter()
        .filter(|req| req.is_borrower(user_id))
        .filter_map(|req| req.lender_feedback.as_ref())
        .map(|feedback| f64::from(feedback.rating.value()))
        .collect();
    let overall: Vec<f64> = as_lender.iter().chain(as_borrower.iter()).copied().collect();

    RatingStats {
        as_lender: RoleRatingStats {
            average: average(&as_lender),
            count: as_lender.len(),
        },
        as_borrower: RoleRatingStats {
            average: average(&as_borrower),
            count: as_borrower.len(),
        },
        overall_average: average(&overall),
        total_count: overall.len(),
    }
}

/// 受け取ったレビュー
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserReview {
    pub id: String,
    pub rating: u8,
    pub review: String,
    pub reviewer: String,
    pub date: DateTime<Utc>,
    pub item_title: String,
}

/// 純粋関数：ユーザーが受け取ったレビューを新しい順に集める
pub fn collect_received_reviews(requests: &[BorrowRequest], user_id: &str) -> Vec<UserReview> {
    if user_id.is_empty() {
        return Vec::new();
    }

    let mut reviews = Vec::new();
    for req in requests {
        if req.is_owner(user_id) {
            if let Some(feedback) = &req.borrower_feedback {
                reviews.push(UserReview {
                    id: format!("{}-borrower-feedback", req.id),
                    rating: feedback.rating.value(),
                    review: feedback.message.clone().unwrap_or_default(),
                    reviewer: req.borrower_name.clone(),
                    date: feedback.at,
                    item_title: req.item_title.clone(),
                });
            }
        }
        if req.is_borrower(user_id) {
            if let Some(feedback) = &req.lender_feedback {
                reviews.push(UserReview {
                    id: format!("{}-lender-feedback", req.id),
                    rating: feedback.rating.value(),
                    review: feedback.message.clone().unwrap_or_default(),
                    reviewer: req.lender_name.clone(),
                    date: feedback.at,
                    item_title: req.item_title.clone(),
                });
            }
        }
    }
    reviews.sort_by(|a, b| b.date.cmp(&a.date));
    reviews
}

/// ダッシュボードの表示区分
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DashboardRole {
    Combined,
    Lender,
    Borrower,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub pending_requests: usize,
    pub active_borrowings: usize,
    pub completed_transactions: usize,
    /// 2桁に丸めた平均評価（評価なしは `None`）
    pub rating: Option<f64>,
    pub total_reviews: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DashboardMetrics {
    pub combined: MetricSummary,
    pub lender: MetricSummary,
    pub borrower: MetricSummary,
}

impl DashboardMetrics {
    pub fn for_role(&self, role: DashboardRole) -> &MetricSummary {
        match role {
            DashboardRole::Combined => &self.combined,
            DashboardRole::Lender => &self.lender,
            DashboardRole::Borrower => &self.borrower,
        }
    }
}

/// ダッシュボード集計で使う本人判定（IDまたは名前のいずれかが一致）
fn involves(user: &AuthUser, candidate_id: Option<&str>, candidate_name: &str) -> bool {
    let own_id = user.id.trim();
    if !own_id.is_empty() && candidate_id.is_some_and(|id| id.trim() == own_id) {
        return true;
    }
    let normalized = normalize_name(candidate_name);
    !normalized.is_empty() && user.name_tokens().contains(&normalized)
}

/// 純粋関数：ダッシュボードの指標を組み立てる
///
/// ビジネスルール：
/// - 保留件数は借り手・貸し手それぞれの一覧から数える
/// - 貸出中は approved と ongoing、完了は completed を数える
/// - 平均評価は2桁に丸める
pub fn build_dashboard_metrics(
    requests: &[BorrowRequest],
    borrower_requests: &[BorrowRequest],
    lender_requests: &[BorrowRequest],
    current_user: Option<&AuthUser>,
    stats: &RatingStats,
) -> DashboardMetrics {
    let mut metrics = DashboardMetrics {
        combined: MetricSummary {
            rating: stats.overall_average.map(round_rating),
            total_reviews: stats.total_count,
            ..MetricSummary::default()
        },
        lender: MetricSummary {
            rating: stats.as_lender.average.map(round_rating),
            total_reviews: stats.as_lender.count,
            ..MetricSummary::default()
        },
        borrower: MetricSummary {
            rating: stats.as_borrower.average.map(round_rating),
            total_reviews: stats.as_borrower.count,
            ..MetricSummary::default()
        },
    };

    let Some(user) = current_user else {
        return metrics;
    };

    metrics.borrower.pending_requests = count_pending(borrower_requests);
    metrics.lender.pending_requests = count_pending(lender_requests);

    for req in requests {
        let is_borrower = involves(user, Some(&req.borrower_id), &req.borrower_name);
        let is_lender = involves(user, req.owner_id.as_deref(), &req.lender_name);
        match req.status {
            RequestStatus::Approved | RequestStatus::Ongoing => {
                if is_borrower {
                    metrics.borrower.active_borrowings += 1;
                }
                if is_lender {
                    metrics.lender.active_borrowings += 1;
                }
            }
            RequestStatus::Completed => {
                if is_borrower {
                    metrics.borrower.completed_transactions += 1;
                }
                if is_lender {
                    metrics.lender.completed_transactions += 1;
                }
            }
            _ => {}
        }
    }

    metrics.combined.pending_requests =
        metrics.borrower.pending_requests + metrics.lender.pending_requests;
    metrics.combined.active_borrowings =
        metrics.borrower.active_borrowings + metrics.lender.active_borrowings;
    metrics.combined.completed_transactions =
        metrics.borrower.completed_transactions + metrics.lender.completed_transactions;

    metrics
}

/// 貸した数・借りた数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemCounts {
    pub lent: usize,
    pub borrowed: usize,
}

/// 純粋関数：承認以降に進んだ取引を貸し手・借り手別に数える
pub fn calculate_user_item_counts(requests: &[BorrowRequest], user_id: &str) -> ItemCounts {
    if user_id.is_empty() {
        return ItemCounts::default();
    }
    let countable = |status: RequestStatus| {
        matches!(
            status,
            RequestStatus::Approved | RequestStatus::Ongoing | RequestStatus::Completed
        )
    };
    ItemCounts {
        lent: requests
            .iter()
            .filter(|req| req.is_owner(user_id) && countable(req.status))
            .count(),
        borrowed: requests
            .iter()
            .filter(|req| req.is_borrower(user_id) && countable(req.status))
            .count(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Request,
    Approval,
    Completion,
    Rating,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: String,
    pub kind: ActivityKind,
    pub title: String,
    pub description: String,
    pub date: DateTime<Utc>,
    pub status: Option<String>,
}

fn capitalize(status: RequestStatus) -> String {
    let text = status.as_str();
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// 純粋関数：最近のアクティビティを組み立てる
///
/// 貸し手として受けたリクエストと借り手としてのリクエストを新しい順に並べ、
/// 既定のアクティビティを後ろに足して最大6件に切り詰める。
pub fn build_recent_activity(
    borrower_requests: &[BorrowRequest],
    lender_requests: &[BorrowRequest],
    base_activity: &[ActivityEntry],
) -> Vec<ActivityEntry> {
    let mut activity: Vec<ActivityEntry> = lender_requests
        .iter()
        .map(|req| ActivityEntry {
            id: format!("lender-{}", req.id),
            kind: ActivityKind::Request,
            title: format!("Request for {}", req.item_title),
            description: format!(
                "{} would like to borrow on {}",
                req.borrower_name,
                req.preferred_date
                    .map(|d| d.to_string())
                    .unwrap_or_default()
            ),
            date: req.request_date,
            status: Some(capitalize(req.status)),
        })
        .collect();

    for req in borrower_requests {
        let label = capitalize(req.status);
        let (kind, description) = match req.status {
            RequestStatus::Completed => (
                ActivityKind::Completion,
                format!("{} marked the borrowing complete", req.lender_name),
            ),
            RequestStatus::Approved => (
                ActivityKind::Approval,
                format!("{} approved your request", req.lender_name),
            ),
            _ => (
                ActivityKind::Request,
                format!("Waiting for {} to respond", req.lender_name),
            ),
        };
        activity.push(ActivityEntry {
            id: format!("borrower-{}", req.id),
            kind,
            title: format!("{} · {}", label, req.item_title),
            description,
            date: req.request_date,
            status: Some(label),
        });
    }

    if activity.is_empty() {
        return base_activity.to_vec();
    }

    activity.sort_by(|a, b| b.date.cmp(&a.date));
    activity.extend(base_activity.iter().cloned());
    activity.truncate(RECENT_ACTIVITY_LIMIT);
    activity
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::borrow_request::fixtures::request;
    use crate::domain::{Feedback, StarRating};
    use chrono::Duration;

    fn rated(id: &str, borrower: u8, lender: Option<u8>) -> BorrowRequest {
        let mut req = request(id, "i1", "b1", RequestStatus::Completed);
        req.borrower_feedback = Some(Feedback {
            rating: StarRating::try_from(borrower).unwrap(),
            message: Some("Thanks".to_string()),
            at: Utc::now(),
        });
        req.lender_feedback = lender.map(|value| Feedback {
            rating: StarRating::try_from(value).unwrap(),
            message: None,
            at: Utc::now(),
        });
        req
    }

    #[test]
    fn test_rating_stats_split_by_role() {
        let requests = vec![rated("1", 5, Some(4)), rated("2", 4, None), rated("3", 4, None)];

        let lender = calculate_rating_stats(&requests, "l1");
        assert_eq!(lender.as_lender.count, 3);
        assert_eq!(lender.as_borrower.count, 0);
        assert_eq!(lender.total_count, 3);

        let borrower = calculate_rating_stats(&requests, "b1");
        assert_eq!(borrower.as_borrower.average, Some(4.0));
        assert_eq!(borrower.as_lender.average, None);

        assert_eq!(calculate_rating_stats(&requests, ""), RatingStats::default());
    }

    #[test]
    fn test_metrics_round_average_to_two_decimals() {
        let requests = vec![rated("1", 5, None), rated("2", 4, None), rated("3", 4, None)];
        let stats = calculate_rating_stats(&requests, "l1");
        let user = AuthUser::new("l1", "Lender One");

        let metrics = build_dashboard_metrics(&requests, &[], &requests, Some(&user), &stats);

        assert_eq!(metrics.lender.rating, Some(4.33));
        assert_eq!(metrics.lender.completed_transactions, 3);
        assert_eq!(metrics.borrower.rating, None);
        assert_eq!(metrics.combined.total_reviews, 3);
    }

    #[test]
    fn test_metrics_count_pending_active_and_completed() {
        let requests = vec![
            request("1", "i1", "b1", RequestStatus::Pending),
            request("2", "i2", "b1", RequestStatus::Approved),
            request("3", "i3", "b1", RequestStatus::Ongoing),
            request("4", "i4", "b1", RequestStatus::Completed),
            request("5", "i5", "b1", RequestStatus::Rejected),
        ];
        let user = AuthUser::new("b1", "Borrower One");
        let stats = RatingStats::default();

        let metrics = build_dashboard_metrics(&requests, &requests, &[], Some(&user), &stats);

        assert_eq!(metrics.borrower.pending_requests, 1);
        assert_eq!(metrics.borrower.active_borrowings, 2);
        assert_eq!(metrics.borrower.completed_transactions, 1);
        assert_eq!(metrics.lender.active_borrowings, 0);
        assert_eq!(*metrics.for_role(DashboardRole::Combined), metrics.borrower);

        let anonymous = build_dashboard_metrics(&requests, &requests, &[], None, &stats);
        assert_eq!(anonymous.combined.pending_requests, 0);
    }

    #[test]
    fn test_received_reviews_newest_first() {
        let mut older = rated("1", 3, None);
        older.borrower_feedback.as_mut().unwrap().at = Utc::now() - Duration::days(3);
        let newer = rated("2", 5, None);

        let reviews = collect_received_reviews(&[older, newer], "l1");
        assert_eq!(reviews.len(), 2);
        assert_eq!(reviews[0].id, "2-borrower-feedback");
        assert_eq!(reviews[0].reviewer, "Borrower One");
    }

    #[test]
    fn test_item_counts_skip_pending_and_rejected() {
        let requests = vec![
            request("1", "i1", "b1", RequestStatus::Pending),
            request("2", "i2", "b1", RequestStatus::Approved),
            request("3", "i3", "b1", RequestStatus::Rejected),
            request("4", "i4", "b1", RequestStatus::Completed),
        ];
        assert_eq!(
            calculate_user_item_counts(&requests, "l1"),
            ItemCounts { lent: 2, borrowed: 0 }
        );
        assert_eq!(
            calculate_user_item_counts(&requests, "b1"),
            ItemCounts { lent: 0, borrowed: 2 }
        );
    }

    #[test]
    fn test_recent_activity_is_capped() {
        let requests: Vec<BorrowRequest> = (0..5)
            .map(|i| request(&i.to_string(), "i1", "b1", RequestStatus::Approved))
            .collect();

        let activity = build_recent_activity(&requests, &requests, &[]);
        assert_eq!(activity.len(), RECENT_ACTIVITY_LIMIT);

        let first_borrower = activity
            .iter()
            .find(|entry| entry.id.starts_with("borrower-"))
            .unwrap();
        assert_eq!(first_borrower.kind, ActivityKind::Approval);
        assert_eq!(first_borrower.description, "Lender One approved your request");
    }

    #[test]
    fn test_recent_activity_falls_back_to_base() {
        let base = vec![ActivityEntry {
            id: "welcome".to_string(),
            kind: ActivityKind::Rating,
            title: "Welcome".to_string(),
            description: String::new(),
            date: Utc::now(),
            status: None,
        }];
        assert_eq!(build_recent_activity(&[], &[], &base), base);
    }
}
