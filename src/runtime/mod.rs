pub mod blueprint;
pub mod plan;
pub mod state;
pub mod retry;
pub mod report;
pub mod engine;
pub mod storage;
