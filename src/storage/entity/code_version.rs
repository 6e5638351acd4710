use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Every attempt of every run, including ones whose generation failed.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "code_versions")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub run_id: String,
    pub attempt: i32,
    #[sea_orm(nullable)]
    pub code: Option<String>,
    #[sea_orm(nullable)]
    pub smoke_dataset: Option<String>,
    pub outcome: String, // SUCCESS or a failure category
    #[sea_orm(nullable)]
    pub message: Option<String>,
    #[sea_orm(nullable)]
    pub metrics_json: Option<String>,
    pub created_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
