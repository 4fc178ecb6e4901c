use tokio::sync::{mpsc, Mutex};

use crate::models::Task;

/// Producer half of a [`TaskQueue`]. Dropping it closes the queue once the
/// remaining tasks are drained.
pub type TaskSender = mpsc::Sender<Task>;

/// Queue of pending tasks shared by all workers of a batch.
///
/// Each task is handed to exactly one worker.
#[derive(Debug)]
pub struct TaskQueue {
    receiver: Mutex<mpsc::Receiver<Task>>,
}

impl TaskQueue {
    /// Create a queue holding at most `capacity` pending tasks.
    pub fn bounded(capacity: usize) -> (TaskSender, Self) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (sender, Self { receiver: Mutex::new(receiver) })
    }

    /// Take the next task, waiting for the producer if needed. Returns `None`
    /// once the producer is gone and the queue is empty.
    pub async fn pop(&self) -> Option<Task> {
        let mut receiver = self.receiver.lock().await;
        receiver.recv().await
    }

    /// Stop accepting tasks and take whatever is still queued.
    pub async fn close(&self) -> Vec<Task> {
        let mut receiver = self.receiver.lock().await;
        receiver.close();
        let mut remaining = Vec::new();
        while let Ok(task) = receiver.try_recv() {
            remaining.push(task);
        }
        remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn task(id: usize) -> Task {
        Task::new(id, "http://example.com/seg.ts".into(), PathBuf::from(format!("{id}.ts")))
    }

    #[tokio::test]
    async fn tasks_come_out_in_order_and_end_with_none() {
        let (sender, queue) = TaskQueue::bounded(4);
        for id in 0..3 {
            sender.send(task(id)).await.unwrap();
        }
        drop(sender);

        let mut ids = Vec::new();
        while let Some(task) = queue.pop().await {
            ids.push(task.id);
        }
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn each_task_goes_to_one_worker() {
        let (sender, queue) = TaskQueue::bounded(2);
        let queue = Arc::new(queue);

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    let mut seen = Vec::new();
                    while let Some(task) = queue.pop().await {
                        seen.push(task.id);
                    }
                    seen
                })
            })
            .collect();

        for id in 0..50 {
            sender.send(task(id)).await.unwrap();
        }
        drop(sender);

        let mut all = Vec::new();
        for worker in workers {
            all.extend(worker.await.unwrap());
        }
        all.sort();
        assert_eq!(all, (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn close_returns_pending_tasks() {
        let (sender, queue) = TaskQueue::bounded(4);
        sender.send(task(0)).await.unwrap();
        sender.send(task(1)).await.unwrap();

        let pending: Vec<_> = queue.close().await.into_iter().map(|t| t.id).collect();
        assert_eq!(pending, vec![0, 1]);
        assert!(sender.send(task(2)).await.is_err());
    }
}
