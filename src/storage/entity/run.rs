use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "runs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(unique)]
    pub run_id: String,
    pub idea: String,
    pub status: String, // GENERATING/REPAIRING/FANOUT/SAVED/BELOW_THRESHOLD/NO_SUCCESS/EXHAUSTED/CANCELLED/ERROR
    pub attempts: i32,
    #[sea_orm(nullable)]
    pub accepted_attempt: Option<i32>,
    #[sea_orm(nullable)]
    pub smoke_dataset: Option<String>,
    pub success_count: i32,
    #[sea_orm(nullable)]
    pub best_return_pct: Option<f64>,
    #[sea_orm(nullable)]
    pub median_return_pct: Option<f64>,
    pub target_met: bool,
    pub rows_saved: i32,
    // {"BTCUSDT:1h:30d:binance": {"ok": true, "return_pct": 5.0}, ...}
    #[sea_orm(nullable)]
    pub outcomes_json: Option<String>,
    #[sea_orm(nullable)]
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
