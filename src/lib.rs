pub mod clock;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod observability;
pub mod outbox;
pub mod policy;
pub mod reaper;
pub mod tenant;
pub mod wal;
