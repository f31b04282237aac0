use clap::Args;
use hoststore::libraries::{LibraryStatus, Provisioner, Registry};
use hoststore::HostStoreConfig;
use serde::Serialize;
use tabled::Tabled;

use super::{print_output, OutputFormat};

/// Arguments for the Libraries command
#[derive(Args)]
pub struct LibrariesArgs {
    /// Show relocation rules and dependencies
    #[clap(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Serialize)]
struct LibraryInfo {
    #[serde(flatten)]
    status: LibraryStatus,
    enabled: bool,
    cached: bool,
    relocations: Vec<String>,
    dependencies: Vec<String>,
}

#[derive(Tabled)]
struct LibraryRow {
    id: String,
    coordinate: String,
    capability: String,
    enabled: bool,
    cached: bool,
    relocations: String,
}

pub fn run(config: &HostStoreConfig, args: LibrariesArgs, format: OutputFormat) -> anyhow::Result<()> {
    let LibrariesArgs { verbose } = args;
    let provisioner = Provisioner::new(config.provisioner_config());
    let registry = Registry::builtin();
    let cache_dir = config.cache_dir();

    let infos: Vec<LibraryInfo> = provisioner
        .status()
        .into_iter()
        .filter_map(|status| {
            let descriptor = registry.get(&status.id)?;
            let cached = cache_dir
                .join(descriptor.cache_dir_name())
                .join(descriptor.file_name())
                .exists();
            Some(LibraryInfo {
                enabled: config.libraries.enabled.contains(&status.id),
                cached,
                relocations: descriptor
                    .relocations
                    .iter()
                    .map(|r| format!("{} -> {}.{}", r.from, config.libraries.namespace, r.to))
                    .collect(),
                dependencies: descriptor.dependencies.clone(),
                status,
            })
        })
        .collect();

    let rows: Vec<LibraryRow> = infos
        .iter()
        .map(|info| LibraryRow {
            id: info.status.id.clone(),
            coordinate: info.status.coordinate.clone(),
            capability: info.status.capability.to_string(),
            enabled: info.enabled,
            cached: info.cached,
            relocations: if verbose {
                info.relocations.join("\n")
            } else {
                info.relocations.len().to_string()
            },
        })
        .collect();

    print_output(format, &infos, &rows)
}
