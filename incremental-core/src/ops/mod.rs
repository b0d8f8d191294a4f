pub mod catalog;
pub mod jobs;
pub mod ledger;
pub mod locks;
pub mod meta;
pub mod pipelines;
pub mod state;
