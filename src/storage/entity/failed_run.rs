use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "failed_runs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub run_id: String,
    pub idea: String,
    pub reason: String, // EXHAUSTED/BELOW_THRESHOLD/NO_SUCCESS/CANCELLED/ERROR/INTERRUPTED
    pub exhausted_at_attempt: i32,
    #[sea_orm(nullable)]
    pub last_error_category: Option<String>,
    #[sea_orm(nullable)]
    pub last_error_message: Option<String>,
    pub created_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
