//! Producer/consumer execution: the driver transforms records and pushes
//! them into a bounded channel; a spawned consumer drains it in bulk-sized
//! batches through the [`Saver`].

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::pipeline::error::PipelineError;
use crate::pipeline::model::PersistedRecord;
use crate::pipeline::saver::{RecordSink, Saver};

#[derive(Debug)]
pub enum QueueMessage {
    Record(PersistedRecord),
    /// Producer is done; drain what is left and flush.
    Finished,
}

/// Producer half. Dropping it without [`QueueSink::finish`] ends the
/// consumer without its final flush; the driver flushes in that case.
pub struct QueueSink {
    tx: mpsc::Sender<QueueMessage>,
}

impl QueueSink {
    pub async fn finish(self) {
        if self.tx.send(QueueMessage::Finished).await.is_err() {
            debug!("consumer already stopped; finish signal dropped");
        }
    }
}

#[async_trait]
impl RecordSink for QueueSink {
    async fn accept(&mut self, record: PersistedRecord) -> Result<(), PipelineError> {
        self.tx
            .send(QueueMessage::Record(record))
            .await
            .map_err(|_| PipelineError::Worker("queue consumer stopped".into()))
    }
}

pub struct ConsumerOutcome {
    /// Handed back so the driver can report counts or flush leftovers.
    pub saver: Saver,
    pub finished: bool,
    pub error: Option<PipelineError>,
}

pub fn spawn_consumer(
    saver: Saver,
    capacity: usize,
    batch_size: usize,
) -> (QueueSink, JoinHandle<ConsumerOutcome>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handle = tokio::spawn(drain(saver, rx, batch_size.max(1)));
    (QueueSink { tx }, handle)
}

async fn drain(
    mut saver: Saver,
    mut rx: mpsc::Receiver<QueueMessage>,
    batch_size: usize,
) -> ConsumerOutcome {
    let mut batch = Vec::with_capacity(batch_size);
    let mut finished = false;
    loop {
        // Returns 0 only once the channel is closed and empty.
        if rx.recv_many(&mut batch, batch_size).await == 0 {
            break;
        }
        for msg in batch.drain(..) {
            match msg {
                QueueMessage::Record(record) => {
                    if let Err(e) = saver.add(record).await {
                        warn!(collection = saver.collection(), error = %e, "consumer stopped");
                        return ConsumerOutcome {
                            saver,
                            finished,
                            error: Some(e),
                        };
                    }
                }
                QueueMessage::Finished => {
                    finished = true;
                    // Keep receiving whatever is still queued, then stop.
                    rx.close();
                }
            }
        }
    }

    let error = if finished {
        saver.finalize().await.err()
    } else {
        None
    };
    ConsumerOutcome {
        saver,
        finished,
        error,
    }
}
