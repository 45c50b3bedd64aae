pub mod build;
pub mod clean;
pub mod export;
pub mod offline;
pub mod verify;
