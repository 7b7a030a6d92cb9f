use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use gridci_engine::{Daemon, DaemonOptions, LogNotifier, RunOptions};
use gridci_executor::DockerSandbox;

pub async fn daemon(
    queue_dir: &Path,
    scan_interval: u64,
    image: &str,
    hard_timeout: u64,
    idle_timeout: u64,
) -> Result<()> {
    std::fs::create_dir_all(queue_dir)?;

    let sandbox = Arc::new(DockerSandbox::new(image)?);
    let options = DaemonOptions {
        scan_interval: Duration::from_secs(scan_interval),
        run: RunOptions {
            hard_timeout: Duration::from_secs(hard_timeout),
            idle_timeout: Duration::from_secs(idle_timeout),
            ..RunOptions::default()
        },
    };

    Daemon::new(queue_dir, sandbox, Arc::new(LogNotifier), options)
        .run()
        .await?;
    Ok(())
}
