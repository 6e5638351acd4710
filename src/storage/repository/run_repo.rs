use crate::storage::entity::code_version::{
    self, ActiveModel as CodeVersionActiveModel, Entity as CodeVersion,
};
use crate::storage::entity::run::{self, ActiveModel as RunActiveModel, Entity as Run};
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};

/// Final numbers of a run, written once when it reaches a terminal status.
#[derive(Clone, Debug, Default)]
pub struct RunSummaryUpdate {
    pub status: String,
    pub attempts: i32,
    pub accepted_attempt: Option<i32>,
    pub smoke_dataset: Option<String>,
    pub success_count: i32,
    pub best_return_pct: Option<f64>,
    pub median_return_pct: Option<f64>,
    pub target_met: bool,
    pub rows_saved: i32,
    pub outcomes_json: Option<String>,
    pub last_error: Option<String>,
}

pub struct RunRepository;

impl RunRepository {
    pub async fn create(
        db: &DatabaseConnection,
        run_id: &str,
        idea: &str,
        status: &str,
    ) -> Result<i32, sea_orm::DbErr> {
        let now = Utc::now().timestamp();
        let active_model = RunActiveModel {
            run_id: Set(run_id.to_string()),
            idea: Set(idea.to_string()),
            status: Set(status.to_string()),
            attempts: Set(0),
            success_count: Set(0),
            target_met: Set(false),
            rows_saved: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };
        let result = active_model.insert(db).await?;
        Ok(result.id)
    }

    pub async fn mark_status(
        db: &DatabaseConnection,
        run_id: &str,
        status: &str,
        attempts: i32,
    ) -> Result<(), sea_orm::DbErr> {
        let now = Utc::now().timestamp();
        Run::update_many()
            .col_expr(run::Column::Status, Expr::value(status.to_string()))
            .col_expr(run::Column::Attempts, Expr::value(attempts))
            .col_expr(run::Column::UpdatedAt, Expr::value(now))
            .filter(run::Column::RunId.eq(run_id))
            .exec(db)
            .await?;
        Ok(())
    }

    pub async fn finish(
        db: &DatabaseConnection,
        run_id: &str,
        summary: RunSummaryUpdate,
    ) -> Result<(), sea_orm::DbErr> {
        let now = Utc::now().timestamp();
        Run::update_many()
            .col_expr(run::Column::Status, Expr::value(summary.status))
            .col_expr(run::Column::Attempts, Expr::value(summary.attempts))
            .col_expr(
                run::Column::AcceptedAttempt,
                Expr::value(summary.accepted_attempt),
            )
            .col_expr(run::Column::SmokeDataset, Expr::value(summary.smoke_dataset))
            .col_expr(run::Column::SuccessCount, Expr::value(summary.success_count))
            .col_expr(
                run::Column::BestReturnPct,
                Expr::value(summary.best_return_pct),
            )
            .col_expr(
                run::Column::MedianReturnPct,
                Expr::value(summary.median_return_pct),
            )
            .col_expr(run::Column::TargetMet, Expr::value(summary.target_met))
            .col_expr(run::Column::RowsSaved, Expr::value(summary.rows_saved))
            .col_expr(run::Column::OutcomesJson, Expr::value(summary.outcomes_json))
            .col_expr(run::Column::LastError, Expr::value(summary.last_error))
            .col_expr(run::Column::UpdatedAt, Expr::value(now))
            .filter(run::Column::RunId.eq(run_id))
            .exec(db)
            .await?;
        Ok(())
    }

    /// Flags a run as failed without touching its other numbers.
    pub async fn mark_error(
        db: &DatabaseConnection,
        run_id: &str,
        status: &str,
        message: &str,
    ) -> Result<(), sea_orm::DbErr> {
        let now = Utc::now().timestamp();
        Run::update_many()
            .col_expr(run::Column::Status, Expr::value(status.to_string()))
            .col_expr(run::Column::LastError, Expr::value(message.to_string()))
            .col_expr(run::Column::UpdatedAt, Expr::value(now))
            .filter(run::Column::RunId.eq(run_id))
            .exec(db)
            .await?;
        Ok(())
    }

    pub async fn find(
        db: &DatabaseConnection,
        run_id: &str,
    ) -> Result<Option<run::Model>, sea_orm::DbErr> {
        Run::find()
            .filter(run::Column::RunId.eq(run_id))
            .one(db)
            .await
    }

    /// Newest first.
    pub async fn list_recent(
        db: &DatabaseConnection,
        limit: u64,
    ) -> Result<Vec<run::Model>, sea_orm::DbErr> {
        Run::find()
            .order_by_desc(run::Column::CreatedAt)
            .order_by_desc(run::Column::Id)
            .limit(limit)
            .all(db)
            .await
    }

    /// Runs still in one of `active` statuses, i.e. owned by a process that
    /// is gone if we are just starting up.
    pub async fn find_in_status(
        db: &DatabaseConnection,
        active: &[&str],
    ) -> Result<Vec<run::Model>, sea_orm::DbErr> {
        Run::find()
            .filter(run::Column::Status.is_in(active.iter().map(|s| s.to_string())))
            .all(db)
            .await
    }
}

pub struct CodeVersionRepository;

impl CodeVersionRepository {
    #[allow(clippy::too_many_arguments)]
    pub async fn insert(
        db: &DatabaseConnection,
        run_id: &str,
        attempt: i32,
        code: Option<String>,
        smoke_dataset: Option<String>,
        outcome: &str,
        message: Option<String>,
        metrics_json: Option<String>,
    ) -> Result<i32, sea_orm::DbErr> {
        let active_model = CodeVersionActiveModel {
            run_id: Set(run_id.to_string()),
            attempt: Set(attempt),
            code: Set(code),
            smoke_dataset: Set(smoke_dataset),
            outcome: Set(outcome.to_string()),
            message: Set(message),
            metrics_json: Set(metrics_json),
            created_at: Set(Utc::now().timestamp()),
            ..Default::default()
        };
        let result = active_model.insert(db).await?;
        Ok(result.id)
    }

    pub async fn list_for_run(
        db: &DatabaseConnection,
        run_id: &str,
    ) -> Result<Vec<code_version::Model>, sea_orm::DbErr> {
        CodeVersion::find()
            .filter(code_version::Column::RunId.eq(run_id))
            .order_by_asc(code_version::Column::Attempt)
            .all(db)
            .await
    }

    pub async fn find_attempt(
        db: &DatabaseConnection,
        run_id: &str,
        attempt: i32,
    ) -> Result<Option<code_version::Model>, sea_orm::DbErr> {
        CodeVersion::find()
            .filter(code_version::Column::RunId.eq(run_id))
            .filter(code_version::Column::Attempt.eq(attempt))
            .one(db)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::connection::establish_connection;

    #[tokio::test]
    async fn run_lifecycle_roundtrip() {
        let db = establish_connection("sqlite::memory:").await.unwrap();
        RunRepository::create(&db, "r1", "idea one", "GENERATING")
            .await
            .unwrap();
        RunRepository::mark_status(&db, "r1", "REPAIRING", 2)
            .await
            .unwrap();
        let r = RunRepository::find(&db, "r1").await.unwrap().unwrap();
        assert_eq!(r.status, "REPAIRING");
        assert_eq!(r.attempts, 2);

        RunRepository::finish(
            &db,
            "r1",
            RunSummaryUpdate {
                status: "SAVED".to_string(),
                attempts: 3,
                accepted_attempt: Some(2),
                success_count: 2,
                best_return_pct: Some(12.0),
                median_return_pct: Some(8.5),
                rows_saved: 2,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let r = RunRepository::find(&db, "r1").await.unwrap().unwrap();
        assert_eq!(r.status, "SAVED");
        assert_eq!(r.accepted_attempt, Some(2));
        assert_eq!(r.best_return_pct, Some(12.0));
        assert!(r.last_error.is_none());
    }

    #[tokio::test]
    async fn finds_runs_left_active() {
        let db = establish_connection("sqlite::memory:").await.unwrap();
        RunRepository::create(&db, "a", "x", "FANOUT").await.unwrap();
        RunRepository::create(&db, "b", "y", "SAVED").await.unwrap();
        RunRepository::create(&db, "c", "z", "GENERATING").await.unwrap();
        let mut ids: Vec<String> = RunRepository::find_in_status(&db, &["GENERATING", "FANOUT"])
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.run_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(RunRepository::list_recent(&db, 2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn code_versions_ordered_by_attempt() {
        let db = establish_connection("sqlite::memory:").await.unwrap();
        for a in [1, 0] {
            CodeVersionRepository::insert(
                &db,
                "r1",
                a,
                Some(format!("v{a}")),
                None,
                "RuntimeError",
                Some("boom".to_string()),
                None,
            )
            .await
            .unwrap();
        }
        let versions = CodeVersionRepository::list_for_run(&db, "r1").await.unwrap();
        assert_eq!(versions[0].attempt, 0);
        let v1 = CodeVersionRepository::find_attempt(&db, "r1", 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(v1.code.as_deref(), Some("v1"));
    }
}
