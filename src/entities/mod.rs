pub mod prelude;

pub mod indexer_checkpoint;
pub mod portfolio_owner;
