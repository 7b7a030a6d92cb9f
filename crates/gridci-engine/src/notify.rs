//! Notification hand-off after finalization.

use async_trait::async_trait;
use tracing::info;

use gridci_core::{Build, Project, Result};

/// Receives exactly one callback per finalized build.
///
/// Report rendering and delivery (mail, webhooks) are external
/// collaborators; they read the finalized record themselves. Callers
/// must invoke this outside the finalization lock scope, so a consumer
/// reading from another process sees the committed state.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn build_finished(&self, project: &Project, build: &Build) -> Result<()>;
}

/// Notifier that reports the verdict to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn build_finished(&self, project: &Project, build: &Build) -> Result<()> {
        info!(
            project = %project.long_name(),
            build = build.number,
            revision = build.short_revision(),
            state = ?build.state,
            "build finished"
        );
        Ok(())
    }
}
