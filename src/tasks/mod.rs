//! 后台任务 / Background tasks

pub mod compaction;

pub use compaction::{compact, spawn_compaction_task};
