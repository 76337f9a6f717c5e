// One-shot job-completion signals
//
// Synchronous requests block until their job goes terminal. The engine
// publishes at most one signal per job; the HTTP layer subscribes before
// waiting and falls back to polling the store.

use dashmap::DashMap;
use tokio::sync::watch;
use uuid::Uuid;

use stratus_core::JobStatus;

/// Registry of per-job completion channels
#[derive(Default)]
pub struct CompletionHub {
    channels: DashMap<Uuid, watch::Sender<Option<JobStatus>>>,
}

impl CompletionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a job's terminal transition. Multiple subscribers
    /// share the same channel.
    pub fn subscribe(&self, job_id: Uuid) -> watch::Receiver<Option<JobStatus>> {
        self.channels
            .entry(job_id)
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    /// Publish a job's terminal status. Removing the channel makes the
    /// signal fire at most once per job; publishing with no subscribers
    /// is a no-op.
    pub fn publish(&self, job_id: Uuid, status: JobStatus) {
        if let Some((_, tx)) = self.channels.remove(&job_id) {
            let _ = tx.send(Some(status));
        }
    }

    /// Drop a job's channel without firing it. Used once a waiter has
    /// observed the terminal state directly from the store.
    pub fn discard(&self, job_id: Uuid) {
        self.channels.remove(&job_id);
    }

    /// Channels currently held (for tests).
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_wakes_subscribers_once() {
        let hub = CompletionHub::new();
        let job_id = Uuid::now_v7();

        let mut rx1 = hub.subscribe(job_id);
        let mut rx2 = hub.subscribe(job_id);

        hub.publish(job_id, JobStatus::Successful);

        rx1.changed().await.unwrap();
        assert_eq!(*rx1.borrow(), Some(JobStatus::Successful));
        rx2.changed().await.unwrap();
        assert_eq!(*rx2.borrow(), Some(JobStatus::Successful));

        // The channel is gone: a second publish has nobody to wake.
        assert!(hub.is_empty());
        hub.publish(job_id, JobStatus::Failed);
        assert_eq!(*rx1.borrow(), Some(JobStatus::Successful));
    }
}
