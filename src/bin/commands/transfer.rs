use std::path::PathBuf;

use anyhow::anyhow;
use clap::Args;
use hoststore::database::{rotate_storage_files, StorageManager, PENDING_STORAGE_FILE};
use hoststore::libraries::Provisioner;
use hoststore::{HostStoreConfig, StorageConfig};
use tabled::Tabled;

use super::{print_output, OutputFormat};

/// Arguments for the Transfer command
#[derive(Args)]
pub struct TransferArgs {
    /// Storage file describing the target store; defaults to storage-new.toml in the data directory
    #[clap(value_name = "STORAGE_FILE")]
    pub target: Option<PathBuf>,

    /// Make the target the active store afterwards (only with the default storage-new.toml)
    #[clap(long)]
    pub activate: bool,
}

#[derive(Tabled)]
struct TransferRow {
    table: String,
    rows: usize,
    failed: usize,
}

pub fn run(config: &HostStoreConfig, args: TransferArgs, format: OutputFormat) -> anyhow::Result<()> {
    let TransferArgs { target, activate } = args;
    let pending = config.data_path().join(PENDING_STORAGE_FILE);
    let default_target = target.is_none();
    let target_file = target.unwrap_or(pending);
    if !target_file.exists() {
        return Err(anyhow!("{} does not exist", target_file.display()));
    }
    if activate && !default_target {
        return Err(anyhow!("--activate only applies to {}", PENDING_STORAGE_FILE));
    }

    let provisioner = Provisioner::new(config.provisioner_config());

    let source_config = config.storage()?;
    let source = StorageManager::new(
        source_config.connection_config(config)?,
        source_config.settings(vec![]),
    );
    source.start(Some(&provisioner))?;

    let target_config = StorageConfig::load(&target_file, false)?;
    let target = StorageManager::new(
        target_config.connection_config(config)?,
        target_config.settings(vec![]),
    );
    if let Err(e) = target.start(Some(&provisioner)) {
        source.shutdown();
        return Err(e.into());
    }

    let result = source.transfer_to(&target);
    source.shutdown();
    target.shutdown();
    let report = result?;

    let rows: Vec<TransferRow> = report
        .tables
        .iter()
        .map(|t| TransferRow {
            table: t.table.clone(),
            rows: t.rows,
            failed: t.failed,
        })
        .collect();
    print_output(format, &report, &rows)?;

    if !report.is_complete() {
        return Err(anyhow!(
            "{} rows could not be transferred",
            report.failures.len()
        ));
    }
    if activate {
        rotate_storage_files(&config.data_path())?;
        println!("{} is now the active storage configuration", config.storage_file().display());
    }
    Ok(())
}
