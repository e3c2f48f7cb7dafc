use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(IndexerCheckpoints::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(IndexerCheckpoints::ContractAddress)
                            .string_len(42)
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(IndexerCheckpoints::LastBlockNumber)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(IndexerCheckpoints::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(PortfolioOwners::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PortfolioOwners::OwnerAddress)
                            .string_len(42)
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(PortfolioOwners::UserName)
                            .string_len(256)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PortfolioOwners::CreatedBlock)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PortfolioOwners::LogIndex)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(PortfolioOwners::TxHash)
                            .string_len(66)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PortfolioOwners::IndexedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_portfolio_owners_user_name")
                    .table(PortfolioOwners::Table)
                    .col(PortfolioOwners::UserName)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(PortfolioOwners::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(IndexerCheckpoints::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum IndexerCheckpoints {
    Table,
    ContractAddress,
    LastBlockNumber,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum PortfolioOwners {
    Table,
    OwnerAddress,
    UserName,
    CreatedBlock,
    LogIndex,
    TxHash,
    IndexedAt,
}
