//! Post-processing workers.
//!
//! A [`Worker`] performs one kind of task on a recording (commercial
//! detection, thumbnails, chapter extraction, concatenation...). Workers come
//! and go at runtime through the [`WorkerRegistry`].

mod command;
mod registry;

pub use command::{CommandWorker, CommandWorkerConfig};
pub use registry::{RegistryEvent, WorkerRegistry};

use std::sync::Arc;

use crate::domain::Recording;
use crate::job::JobListener;

/// Capability contract for post-processing workers.
pub trait Worker: Send + Sync {
    /// Title matched against a rule's task settings.
    fn title(&self) -> &str;

    /// Heavy workers process the whole media file; light workers only sample it.
    fn is_heavy(&self) -> bool;

    /// Begin processing `recording` and return without waiting.
    ///
    /// The worker must eventually fire exactly one `Complete` event on
    /// `listener`, including when the work fails or is cancelled. It may fire
    /// `Updated` when it changed fields of the recording; attach the changed
    /// copy with [`JobEvent::with_recording`](crate::job::JobEvent::with_recording)
    /// on `Updated` or `Complete` and only those fields are written back.
    fn work(&self, recording: Arc<Recording>, listener: Arc<dyn JobListener>);

    /// Abort processing of `recording`, if running.
    fn cancel(&self, recording: &Recording);
}

impl std::fmt::Debug for dyn Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("title", &self.title())
            .field("heavy", &self.is_heavy())
            .finish()
    }
}
