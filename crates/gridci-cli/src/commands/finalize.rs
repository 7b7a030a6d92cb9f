use anyhow::Result;
use std::path::Path;

use gridci_engine::{finalize_and_notify, Finalize, LogNotifier};
use gridci_store::JobSetDir;

pub async fn finalize(bundle: &Path) -> Result<()> {
    let bundle = JobSetDir::open(bundle)?;
    match finalize_and_notify(&bundle, &LogNotifier).await? {
        Finalize::Performed(state) => println!("job set finalized: {:?}", state),
        Finalize::Noop => println!("nothing to finalize"),
    }
    Ok(())
}
