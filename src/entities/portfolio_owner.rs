use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "portfolio_owners")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub owner_address: String,
    pub user_name: String,
    pub created_block: i64,
    pub log_index: i64,
    pub tx_hash: String,
    pub indexed_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
