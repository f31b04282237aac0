use anyhow::anyhow;
use clap::Args;
use hoststore::libraries::{Provisioner, RuntimeLibrary};
use hoststore::HostStoreConfig;
use serde::Serialize;
use tabled::Tabled;
use tracing::info;

use super::{print_output, OutputFormat};

/// Arguments for the Provision command
#[derive(Args)]
pub struct ProvisionArgs {
    /// Library ids to provision, e.g. "duckdb" or "postgresql"; defaults to the enabled libraries
    #[clap(value_name = "LIBRARY")]
    pub libraries: Vec<String>,

    /// Provision every known library
    #[clap(long, short)]
    pub all: bool,
}

#[derive(Debug, Serialize)]
struct ProvisionResult {
    id: String,
    state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    classes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    driver_entry_point: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Tabled)]
struct ProvisionRow {
    id: String,
    state: String,
    classes: usize,
    detail: String,
}

pub fn run(config: &HostStoreConfig, args: ProvisionArgs, format: OutputFormat) -> anyhow::Result<()> {
    let ProvisionArgs { libraries, all } = args;

    let ids: Vec<String> = if all {
        RuntimeLibrary::all().iter().map(|l| l.id().to_string()).collect()
    } else if libraries.is_empty() {
        config.libraries.enabled.clone()
    } else {
        libraries
    };
    if ids.is_empty() {
        return Err(anyhow!(
            "no library given and none enabled in the configuration; known libraries: {}",
            RuntimeLibrary::all()
                .iter()
                .map(|l| l.id())
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }

    let provisioner = Provisioner::new(config.provisioner_config());
    let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    let report = provisioner.provision_enabled(&id_refs);
    info!(
        "{} downloads, {} ready, {} failed",
        provisioner.resolver().downloads(),
        report.ready.len(),
        report.failed.len()
    );

    let results: Vec<ProvisionResult> = ids
        .iter()
        .map(|id| match provisioner.handle(id) {
            Some(handle) => ProvisionResult {
                id: id.clone(),
                state: "ready".to_string(),
                path: Some(handle.path().display().to_string()),
                classes: handle.class_count(),
                driver_entry_point: handle.driver().map(|d| d.entry_point),
                error: None,
            },
            None => ProvisionResult {
                id: id.clone(),
                state: "failed".to_string(),
                path: None,
                classes: 0,
                driver_entry_point: None,
                error: provisioner.failure(id).map(|e| e.to_string()),
            },
        })
        .collect();

    let rows: Vec<ProvisionRow> = results
        .iter()
        .map(|r| ProvisionRow {
            id: r.id.clone(),
            state: r.state.clone(),
            classes: r.classes,
            detail: r
                .error
                .clone()
                .or_else(|| r.path.clone())
                .unwrap_or_default(),
        })
        .collect();
    print_output(format, &results, &rows)?;

    if report.all_ready() {
        Ok(())
    } else {
        Err(anyhow!("{} of {} libraries failed", report.failed.len(), ids.len()))
    }
}
