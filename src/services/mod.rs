pub mod cleanup;
pub mod compensation;
pub mod ledger;
pub mod renditions;
pub mod resource_manager;
pub mod staging;
pub mod storage;
