//! Collaborator boundary
//!
//! Host lifecycle hooks call [`HostStore::startup`] once and
//! [`HostStore::shutdown`] once. A storage failure disables storage-backed
//! features only; provisioning and the library-ready signal keep working.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::{HostStoreConfig, StorageConfig};
use crate::database::{
    pending_storage_file, rotate_storage_files, DrainReport, Migration, StorageManager,
};
use crate::error::StorageError;
use crate::libraries::Provisioner;

pub struct HostStore {
    config: HostStoreConfig,
    provisioner: Arc<Provisioner>,
    storage: Result<Arc<StorageManager>, StorageError>,
}

impl HostStore {
    /// Provision the enabled libraries, then bring up storage
    ///
    /// A pending `storage-new.toml` is honored: the current store is copied
    /// into the new one, which then replaces it.
    pub fn startup(config: HostStoreConfig, migrations: Vec<Migration>) -> HostStore {
        let provisioner = Arc::new(Provisioner::new(config.provisioner_config()));

        let enabled: Vec<&str> = config.libraries.enabled.iter().map(String::as_str).collect();
        if !enabled.is_empty() {
            let report = provisioner.provision_enabled(&enabled);
            info!(
                "{} of {} optional libraries ready",
                report.ready.len(),
                enabled.len()
            );
        }

        let storage = start_storage(&config, &provisioner, migrations);
        if let Err(e) = &storage {
            error!("storage unavailable, storage-backed features are disabled: {}", e.chain());
        }

        HostStore {
            config,
            provisioner,
            storage,
        }
    }

    pub fn config(&self) -> &HostStoreConfig {
        &self.config
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    /// The ready store, or why there is none
    pub fn storage(&self) -> Result<&StorageManager, StorageError> {
        let storage = self.storage.as_ref().map_err(Clone::clone)?;
        match storage.failure() {
            Some(e) => Err(e),
            None => Ok(storage.as_ref()),
        }
    }

    /// Whether optional library `id` has been provisioned and loaded
    pub fn is_library_ready(&self, id: &str) -> bool {
        self.provisioner.is_ready(id)
    }

    pub fn shutdown(&self) -> DrainReport {
        match &self.storage {
            Ok(storage) => storage.shutdown(),
            Err(_) => DrainReport {
                closed: 0,
                forced: 0,
            },
        }
    }
}

fn config_error(e: anyhow::Error) -> StorageError {
    StorageError::Config(format!("{:#}", e))
}

fn open(
    config: &HostStoreConfig,
    storage: &StorageConfig,
    provisioner: &Provisioner,
    migrations: Vec<Migration>,
) -> Result<Arc<StorageManager>, StorageError> {
    let manager = Arc::new(StorageManager::new(
        storage.connection_config(config)?,
        storage.settings(migrations),
    ));
    manager.start(Some(provisioner))?;
    Ok(manager)
}

fn start_storage(
    config: &HostStoreConfig,
    provisioner: &Provisioner,
    migrations: Vec<Migration>,
) -> Result<Arc<StorageManager>, StorageError> {
    let current_config = config.storage().map_err(config_error)?;
    let current = open(config, &current_config, provisioner, migrations.clone())?;

    let Some(pending) = pending_storage_file(&config.data_path()) else {
        return Ok(current);
    };
    info!(
        "found {}, transferring data from the {} store",
        pending.display(),
        current.kind()
    );

    let next = match StorageConfig::load(&pending, false)
        .map_err(config_error)
        .and_then(|next_config| open(config, &next_config, provisioner, migrations))
    {
        Ok(next) => next,
        Err(e) => {
            error!("failed to open the new store, keeping the current one: {}", e.chain());
            return Ok(current);
        }
    };

    let report = match current.transfer_to(&next) {
        Ok(report) => report,
        Err(e) => {
            error!("store transfer failed, keeping the current store: {}", e.chain());
            next.shutdown();
            return Ok(current);
        }
    };
    if !report.is_complete() {
        warn!(
            "{} rows could not be transferred; see the log above",
            report.failures.len()
        );
    }

    current.shutdown();
    if let Err(e) = rotate_storage_files(&config.data_path()) {
        error!("{}", e);
    }
    Ok(next)
}
