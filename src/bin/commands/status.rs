use clap::Args;
use hoststore::database::{pending_storage_file, StorageManager};
use hoststore::libraries::Provisioner;
use hoststore::HostStoreConfig;
use serde::Serialize;
use tabled::Tabled;

use super::{print_output, OutputFormat};

/// Arguments for the Status command
#[derive(Args)]
pub struct StatusArgs {
    /// Also count the rows of every table
    #[clap(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Serialize)]
struct StorageStatus {
    method: String,
    target: String,
    state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    schema_version: Option<u32>,
    tables: Vec<TableStatus>,
    pending_transfer: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize, Tabled)]
struct TableStatus {
    table: String,
    columns: String,
    #[tabled(display = "display_rows")]
    rows: Option<usize>,
}

fn display_rows(rows: &Option<usize>) -> String {
    rows.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string())
}

pub fn run(config: &HostStoreConfig, args: StatusArgs, format: OutputFormat) -> anyhow::Result<()> {
    let StatusArgs { verbose } = args;
    let storage_config = config.storage()?;
    let connection = storage_config.connection_config(config)?;
    let target = connection.target();

    let provisioner = Provisioner::new(config.provisioner_config());
    let manager = StorageManager::new(connection, storage_config.settings(vec![]));
    let started = manager.start(Some(&provisioner));

    let mut tables = vec![];
    if started.is_ok() {
        for table in manager.tables()? {
            let rows = if verbose {
                Some(manager.keys(&table)?.len())
            } else {
                None
            };
            tables.push(TableStatus {
                columns: manager.columns(&table)?.join(", "),
                table,
                rows,
            });
        }
    }

    let status = StorageStatus {
        method: manager.kind().to_string(),
        target,
        state: manager.state().to_string(),
        schema_version: started.is_ok().then(|| manager.schema_version()),
        tables,
        pending_transfer: pending_storage_file(&config.data_path()).is_some(),
        error: started.as_ref().err().map(|e| e.chain()),
    };
    manager.shutdown();

    if !format_is_json(format) {
        println!("Storage:  {} ({})", status.method, status.target);
        println!("State:    {}", status.state);
        if let Some(v) = status.schema_version {
            println!("Schema:   v{}", v);
        }
        if let Some(e) = &status.error {
            println!("Error:    {}", e);
        }
        if status.pending_transfer {
            println!("Pending:  storage-new.toml will be transferred on next startup");
        }
        println!();
    }
    print_output(format, &status, &status.tables)
}

fn format_is_json(format: OutputFormat) -> bool {
    matches!(format, OutputFormat::Json | OutputFormat::JsonPretty)
}
