use std::sync::{Arc, Mutex};

use ap_core::queue::{ExecutionError, QueueItem, RunExecutor, RunQueue, SessionRunRequest};
use ap_daemon::queue::QueueProcessor;
use ap_harness::timer::TickHandler;
use async_trait::async_trait;

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl RunExecutor for Recorder {
    async fn execute(&self, item: QueueItem) -> Result<String, ExecutionError> {
        let label = item.label();
        self.seen.lock().unwrap().push(label.clone());
        if label == "task:broken" {
            return Err(ExecutionError::Failed("tool crashed".into()));
        }
        Ok(format!("ran {label}"))
    }
}

#[tokio::test]
async fn one_item_per_tick_in_fifo_order() {
    let queue = Arc::new(RunQueue::new());
    let recorder = Arc::new(Recorder::default());
    let processor = QueueProcessor::new(queue.clone(), recorder.clone());

    queue.enqueue_task("a").await;
    queue.enqueue_task("b").await;
    queue
        .enqueue_session_run(SessionRunRequest::user("s1", "hello"))
        .await;

    processor.tick().await;
    assert_eq!(queue.len().await, 2);
    assert_eq!(*recorder.seen.lock().unwrap(), vec!["task:a"]);

    processor.tick().await;
    processor.tick().await;
    assert!(queue.is_empty().await);
    assert_eq!(
        *recorder.seen.lock().unwrap(),
        vec!["task:a", "task:b", "session:s1"]
    );
}

#[tokio::test]
async fn empty_queue_does_not_record_processing() {
    let processor = QueueProcessor::new(Arc::new(RunQueue::new()), Arc::new(Recorder::default()));
    assert!(!processor.process_next().await);
    assert!(processor.last_processed_at().await.is_none());
}

#[tokio::test]
async fn failed_item_does_not_block_the_next() {
    let queue = Arc::new(RunQueue::new());
    let recorder = Arc::new(Recorder::default());
    let processor = QueueProcessor::new(queue.clone(), recorder.clone());

    queue.enqueue_task("broken").await;
    queue.enqueue_task("fine").await;

    assert!(processor.process_next().await);
    assert!(processor.last_processed_at().await.is_some());
    assert!(processor.process_next().await);
    assert_eq!(
        *recorder.seen.lock().unwrap(),
        vec!["task:broken", "task:fine"]
    );
}
