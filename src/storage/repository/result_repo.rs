use crate::backtest::model::Metrics;
use crate::dataset::DatasetSpec;
use crate::storage::entity::failed_run::{
    self, ActiveModel as FailedRunActiveModel, Entity as FailedRun,
};
use crate::storage::entity::strategy_result::{
    self, ActiveModel as StrategyResultActiveModel, Entity as StrategyResult,
};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set,
};

/// Append-only: rows are inserted one at a time and never updated.
pub struct ResultRepository;

impl ResultRepository {
    pub async fn insert(
        db: &DatabaseConnection,
        run_id: &str,
        spec: &DatasetSpec,
        attempt: u32,
        metrics: &Metrics,
        target_met: bool,
    ) -> Result<i32, sea_orm::DbErr> {
        let active_model = StrategyResultActiveModel {
            run_id: Set(run_id.to_string()),
            dataset: Set(spec.to_string()),
            symbol: Set(spec.symbol.clone()),
            timeframe: Set(spec.timeframe.clone()),
            attempt_number: Set(attempt as i32),
            return_pct: Set(metrics.return_pct),
            buy_hold_pct: Set(metrics.buy_hold_pct),
            max_drawdown_pct: Set(metrics.max_drawdown_pct),
            sharpe: Set(metrics.sharpe),
            sortino: Set(metrics.sortino),
            trade_count: Set(metrics.trade_count),
            target_met: Set(target_met),
            code_reference: Set(code_reference(run_id, attempt)),
            timestamp: Set(Utc::now().timestamp()),
            ..Default::default()
        };
        let result = active_model.insert(db).await?;
        Ok(result.id)
    }

    /// Best return first.
    pub async fn list_for_run(
        db: &DatabaseConnection,
        run_id: &str,
    ) -> Result<Vec<strategy_result::Model>, sea_orm::DbErr> {
        StrategyResult::find()
            .filter(strategy_result::Column::RunId.eq(run_id))
            .order_by_desc(strategy_result::Column::ReturnPct)
            .all(db)
            .await
    }
}

pub fn code_reference(run_id: &str, attempt: u32) -> String {
    format!("{run_id}#{attempt}")
}

/// Splits a `code_reference` back into run id and attempt.
pub fn parse_code_reference(reference: &str) -> Option<(&str, i32)> {
    let (run_id, attempt) = reference.rsplit_once('#')?;
    Some((run_id, attempt.parse().ok()?))
}

pub struct FailedRunRepository;

impl FailedRunRepository {
    pub async fn insert(
        db: &DatabaseConnection,
        run_id: &str,
        idea: &str,
        reason: &str,
        exhausted_at_attempt: i32,
        last_error_category: Option<String>,
        last_error_message: Option<String>,
    ) -> Result<i32, sea_orm::DbErr> {
        let active_model = FailedRunActiveModel {
            run_id: Set(run_id.to_string()),
            idea: Set(idea.to_string()),
            reason: Set(reason.to_string()),
            exhausted_at_attempt: Set(exhausted_at_attempt),
            last_error_category: Set(last_error_category),
            last_error_message: Set(last_error_message),
            created_at: Set(Utc::now().timestamp()),
            ..Default::default()
        };
        let result = active_model.insert(db).await?;
        Ok(result.id)
    }

    pub async fn find_for_run(
        db: &DatabaseConnection,
        run_id: &str,
    ) -> Result<Option<failed_run::Model>, sea_orm::DbErr> {
        FailedRun::find()
            .filter(failed_run::Column::RunId.eq(run_id))
            .order_by_desc(failed_run::Column::Id)
            .one(db)
            .await
    }
}
