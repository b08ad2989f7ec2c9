//! Parser tasks and their in-memory repository

mod model;
mod repository;

pub use model::{
    BuildOptions, ItemStatus, ParserTask, TaskError, TaskLogEntry, TaskLogLevel, TaskResult, TaskSnapshot,
    TaskStatus, TaskType,
};
pub use repository::TaskRepository;
