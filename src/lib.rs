pub mod backend;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod error;
pub mod git;
pub mod kanban;
pub mod lifecycle;
pub mod lock;
pub mod log;
pub mod merge;
pub mod process;
pub mod prompt;
pub mod scheduler;
pub mod state;
pub mod types;
pub mod workspace;
