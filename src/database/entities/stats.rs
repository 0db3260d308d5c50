use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "stats")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub server_id: String,
    /// Unix millis.
    pub timestamp: i64,
    pub uptime: i64,
    pub bytes_in: i64,
    pub bytes_out: i64,
    pub latency_ms: Option<i64>,
    pub reconnect_count: i64,
    pub disconnect_reason: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
