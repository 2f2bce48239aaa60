//! Engine-facing notification sink.

use speech_types::Notification;

/// Synchronous receiver for driver notifications.
///
/// The dispatch proxy forwards events in the order the driver raised them,
/// without queueing or coalescing. Implementations are invoked from driver
/// threads and must not block.
pub trait EngineSink: Send + Sync {
    fn notify(&self, event: Notification);
}

impl EngineSink for crossbeam_channel::Sender<Notification> {
    fn notify(&self, event: Notification) {
        // the receiving side may already be gone during teardown
        let _ = self.send(event);
    }
}
