//! One decode job: fetch, decode, deliver in order

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use super::pool::{WorkerMessage, WorkerMessageKind};
use super::{SegmentDecoder, SegmentTask};
use crate::resource::AssetCache;
use crate::types::VisualFrame;

pub(super) struct WorkerJob {
    pub generation: u64,
    pub task_id: u64,
    pub task: SegmentTask,
    pub assets: Arc<AssetCache>,
    pub decoder: Arc<dyn SegmentDecoder>,
    pub fetch_timeout: Duration,
    pub token: CancellationToken,
    pub tx: mpsc::UnboundedSender<WorkerMessage>,
}

/// Run a job to completion or cancellation.
///
/// A cancelled worker exits silently; the pool has already forgotten it.
pub(super) async fn run(job: WorkerJob) {
    let WorkerJob { generation, task_id, task, assets, decoder, fetch_timeout, token, tx } = job;
    let report =
        |kind: WorkerMessageKind| tx.send(WorkerMessage { generation, task_id, kind }).is_ok();

    let fetched = tokio::select! {
        _ = token.cancelled() => {
            trace!(task = task_id, "Cancelled during fetch");
            return;
        }
        fetched = tokio::time::timeout(fetch_timeout, assets.load_segment(&task.name)) => fetched,
    };
    let bytes = match fetched {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
            report(WorkerMessageKind::Skipped { reason: e.to_string() });
            return;
        }
        Err(_) => {
            report(WorkerMessageKind::Skipped {
                reason: format!("fetch exceeded {}ms", fetch_timeout.as_millis()),
            });
            return;
        }
    };

    let images = tokio::select! {
        _ = token.cancelled() => {
            trace!(task = task_id, "Cancelled during decode");
            return;
        }
        decoded = decoder.decode(&task.name, bytes) => match decoded {
            Ok(images) => images,
            Err(e) => {
                warn!(task = task_id, clip = %task.name, error = %e, "Segment decode failed");
                report(WorkerMessageKind::Failed { reason: e.to_string() });
                return;
            }
        },
    };

    let mut delivered = 0u32;
    for (position, image) in images.into_iter().enumerate() {
        if token.is_cancelled() {
            return;
        }
        let Ok(local_index) = u32::try_from(position) else { break };
        let Some(global_index) = task.global_index(local_index) else { continue };

        let frame = VisualFrame {
            image,
            clip: Arc::clone(&task.name),
            body_id: task.body_id,
            local_index,
            offset: Arc::clone(&task.offset_vector),
        };
        if !report(WorkerMessageKind::Frame { global_index, frame }) {
            return;
        }
        delivered += 1;
    }

    report(WorkerMessageKind::Finished { frames: delivered });
}
