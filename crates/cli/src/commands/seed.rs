use std::fs;
use std::path::Path;

use crate::commands::{async_runtime, load_config, CommandFailure, CommandResult};
use crmsight_core::config::LoadOptions;
use crmsight_db::{connect_warehouse_writer, DemoWarehouseDataset, TableSeedInfo};

/// Rebuilds the demo warehouse from scratch and writes the matching metadata
/// document when none exists at `metadata.path`. Safe to run repeatedly.
pub fn run(options: &LoadOptions) -> CommandResult {
    let config = match load_config("seed", options) {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match async_runtime("seed") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let metadata_written = match ensure_metadata(&config.metadata.path) {
        Ok(written) => written,
        Err(message) => return CommandResult::failure("seed", "metadata_write", message, 5),
    };

    let result = runtime.block_on(async {
        let pool = connect_warehouse_writer(&config.warehouse.url, config.warehouse.query_timeout_secs)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;

        DemoWarehouseDataset::clean(&pool)
            .await
            .map_err(|error| ("seed_execution", error.to_string(), 5u8))?;
        let seed_result = DemoWarehouseDataset::load(&pool)
            .await
            .map_err(|error| ("seed_execution", error.to_string(), 5u8))?;

        let verification = DemoWarehouseDataset::verify(&pool)
            .await
            .map_err(|error| ("seed_verification", error.to_string(), 6u8))?;

        let run_result: Result<Vec<TableSeedInfo>, CommandFailure> = if verification.all_present {
            Ok(seed_result.tables_seeded)
        } else {
            let failed_checks = verification
                .checks
                .iter()
                .filter_map(|(check, passed)| (!passed).then_some(*check))
                .collect::<Vec<_>>();
            Err(("seed_verification", verification_message(&failed_checks), 6u8))
        };

        pool.close().await;
        run_result
    });

    match result {
        Ok(tables) => {
            let table_lines: Vec<String> = tables
                .iter()
                .map(|table| format!("  - {} ({}): {} rows", table.table, table.crm_object, table.rows))
                .collect();
            let metadata_line = if metadata_written {
                format!("metadata written to {}", config.metadata.path.display())
            } else {
                format!("metadata kept at {}", config.metadata.path.display())
            };
            let message = format!(
                "demo CRM warehouse loaded into `{}`:\n{}\n{metadata_line}",
                config.warehouse.url,
                table_lines.join("\n")
            );
            CommandResult::success("seed", message)
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("seed", error_class, message, exit_code)
        }
    }
}

fn ensure_metadata(path: &Path) -> Result<bool, String> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|error| format!("could not create {}: {error}", parent.display()))?;
    }
    fs::write(path, DemoWarehouseDataset::METADATA_JSON)
        .map_err(|error| format!("could not write {}: {error}", path.display()))?;
    Ok(true)
}

fn verification_message(failed_checks: &[&str]) -> String {
    if failed_checks.is_empty() {
        "some demo tables failed to load".to_string()
    } else {
        format!("seed verification failed for checks: {}", failed_checks.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::{ensure_metadata, verification_message};

    #[test]
    fn verification_error_message_targets_failed_checks() {
        assert_eq!(
            verification_message(&["Lead", "opportunity-accounts"]),
            "seed verification failed for checks: Lead, opportunity-accounts"
        );
    }

    #[test]
    fn verification_error_message_falls_back_to_generic_when_no_labels() {
        assert_eq!(verification_message(&[]), "some demo tables failed to load");
    }

    #[test]
    fn existing_metadata_is_left_alone() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let path = dir.path().join("nested").join("crm_metadata.json");

        assert!(ensure_metadata(&path).expect("first write"));
        std::fs::write(&path, "{\"tables\":{}}").expect("overwrite");
        assert!(!ensure_metadata(&path).expect("second call"));
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "{\"tables\":{}}");
    }
}
