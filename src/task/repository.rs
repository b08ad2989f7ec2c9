//! In-memory task store

use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use super::model::ParserTask;

/// Tasks by id. Entries live until [`TaskRepository::remove_finished`] sweeps them.
#[derive(Debug, Default)]
pub struct TaskRepository {
    tasks: DashMap<Uuid, Arc<ParserTask>>,
}

impl TaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a task.
    pub fn save(&self, task: Arc<ParserTask>) -> Arc<ParserTask> {
        self.tasks.insert(task.id(), task.clone());
        task
    }

    pub fn find_by_id(&self, id: &Uuid) -> Option<Arc<ParserTask>> {
        self.tasks.get(id).map(|entry| entry.value().clone())
    }

    /// All tasks, newest first.
    pub fn find_all(&self) -> Vec<Arc<ParserTask>> {
        let mut tasks: Vec<Arc<ParserTask>> = self.tasks.iter().map(|e| e.value().clone()).collect();
        tasks.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        tasks
    }

    /// Remove every task in a terminal state and return their ids.
    pub fn remove_finished(&self) -> Vec<Uuid> {
        let candidates: Vec<Uuid> = self
            .tasks
            .iter()
            .filter(|e| e.value().is_terminal())
            .map(|e| *e.key())
            .collect();

        candidates
            .into_iter()
            .filter(|id| self.tasks.remove_if(id, |_, task| task.is_terminal()).is_some())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskStatus, TaskType};

    fn task(slug: &str) -> Arc<ParserTask> {
        Arc::new(ParserTask::new(TaskType::Parse, vec![slug.to_string()]))
    }

    #[test]
    fn save_and_find() {
        let repo = TaskRepository::new();
        let t = repo.save(task("a"));
        assert_eq!(repo.find_by_id(&t.id()).unwrap().slugs(), ["a".to_string()]);
        assert!(repo.find_by_id(&Uuid::new_v4()).is_none());
        repo.save(t.clone());
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn find_all_newest_first() {
        let repo = TaskRepository::new();
        let first = repo.save(task("a"));
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = repo.save(task("b"));
        let ids: Vec<Uuid> = repo.find_all().iter().map(|t| t.id()).collect();
        assert_eq!(ids, vec![second.id(), first.id()]);
    }

    #[test]
    fn remove_finished_only_removes_terminal() {
        let repo = TaskRepository::new();
        let pending = repo.save(task("pending"));
        let running = repo.save(task("running"));
        running.begin().unwrap();
        let importing = repo.save(task("importing"));
        importing.begin().unwrap();
        importing.set_status(TaskStatus::ImportingManga).unwrap();

        let mut finished = Vec::new();
        for (slug, status) in [
            ("done", TaskStatus::Completed),
            ("failed", TaskStatus::Failed),
            ("cancelled", TaskStatus::Cancelled),
        ] {
            let t = repo.save(task(slug));
            t.begin().unwrap();
            t.finish(status, "finished").unwrap();
            finished.push(t.id());
        }

        let mut removed = repo.remove_finished();
        removed.sort();
        finished.sort();
        assert_eq!(removed, finished);

        let remaining: Vec<Uuid> = repo.find_all().iter().map(|t| t.id()).collect();
        assert_eq!(remaining.len(), 3);
        for id in [pending.id(), running.id(), importing.id()] {
            assert!(remaining.contains(&id));
        }
        assert!(repo.remove_finished().is_empty());
    }
}
