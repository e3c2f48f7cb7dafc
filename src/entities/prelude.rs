#![allow(unused_imports)]

pub use super::indexer_checkpoint::Entity as IndexerCheckpoint;
pub use super::portfolio_owner::Entity as PortfolioOwner;
