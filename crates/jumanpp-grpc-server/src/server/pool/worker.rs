use super::{event::WorkRequest, manager::Dispatcher};
use std::{ops::ControlFlow, sync::Arc};
use tokio::sync::mpsc;

fn handle(_worker_id: usize, work: WorkRequest, dispatcher: &Dispatcher) -> ControlFlow<()> {
    match work {
        WorkRequest::Event(event) => {
            dispatcher.dispatch(event);
            ControlFlow::Continue(())
        }
        WorkRequest::Shutdown { response } => {
            #[cfg(feature = "tracing")]
            tracing::debug!("Worker {_worker_id} received shutdown signal");

            if response.send(()).is_err() {
                #[cfg(feature = "tracing")]
                tracing::error!("Worker {_worker_id} failed to acknowledge shutdown");
            }
            ControlFlow::Break(())
        }
    }
}

/// I/O worker task.
///
/// Drains the I/O queue until a [`WorkRequest::Shutdown`] is received. Every
/// transition run here must return quickly.
pub async fn io_loop(
    worker_id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<WorkRequest>>>,
    dispatcher: Dispatcher,
) {
    #[cfg(feature = "tracing")]
    tracing::trace!("I/O worker {worker_id} started");

    loop {
        let Some(work) = rx.lock().await.recv().await else {
            break;
        };
        if handle(worker_id, work, &dispatcher).is_break() {
            break;
        }
    }

    #[cfg(feature = "tracing")]
    tracing::trace!("I/O worker {worker_id} stopped");
}

/// Compute worker thread.
///
/// Blocks on the compute queue until a [`WorkRequest::Shutdown`] is received.
/// Transitions run here may analyze for as long as they need.
pub fn compute_loop(
    worker_id: usize,
    rx: Arc<parking_lot::Mutex<mpsc::UnboundedReceiver<WorkRequest>>>,
    dispatcher: Dispatcher,
) {
    #[cfg(feature = "tracing")]
    tracing::trace!("Compute worker {worker_id} started");

    loop {
        let Some(work) = rx.lock().blocking_recv() else {
            break;
        };
        if handle(worker_id, work, &dispatcher).is_break() {
            break;
        }
    }

    #[cfg(feature = "tracing")]
    tracing::trace!("Compute worker {worker_id} stopped");
}
