//! Spool directory retry sweep (C9).
//!
//! Two independent passes, run back to back on each wake of the
//! supervisor's ticker:
//!
//! - Phase A re-enriches everything left in the root spool directory by
//!   [`crate::scp::handle_association`] when the enrichment query failed,
//!   then either stores it to its configured peers or, on a second
//!   failure, demotes it into `<spool>/<server>/`.
//! - Phase B re-sends everything already demoted to a per-server
//!   subdirectory, leaving it in place on another failure.
//!
//! Grounded on the oxidicom-era assumption (seen in `writer.rs`'s
//! `FileToStore` bookkeeping) that a spooled file is self-describing: it
//! carries everything `store_client::send_to_server` needs, plus the
//! private [`crate::dicom_tags::RETIRED_PRINT_QUEUE_ID`] tag identifying
//! which printer group queued it.

use dicom::object::InMemDicomObject;

use crate::config::ConfigView;
use crate::dicom_tags::RETIRED_PRINT_QUEUE_ID;
use crate::enrichment;
use crate::ocr::{NullOcrEngine, OcrEngine};
use crate::settings::Settings;
use crate::spool;
use crate::store_client;

#[derive(thiserror::Error, Debug)]
pub enum RetryError {
    #[error("failed to list spool directory")]
    List(#[source] std::io::Error),
}

/// Outcome of a single sweep, logged by the supervisor.
#[derive(Debug, Default)]
pub struct RetrySummary {
    pub re_enriched: usize,
    pub re_stored: usize,
    pub still_pending: usize,
}

impl RetrySummary {
    pub fn is_active(&self) -> bool {
        self.re_enriched > 0 || self.re_stored > 0 || self.still_pending > 0
    }
}

/// Run one retry sweep synchronously. Called from `spawn_blocking` by
/// the supervisor so the enrichment HTTP calls and association I/O
/// inside it never block the async reactor.
pub fn run_once(settings: &Settings, config: &ConfigView) -> Result<RetrySummary, RetryError> {
    let mut summary = RetrySummary::default();
    retry_enrichment(settings, config, &mut summary)?;
    retry_storage(settings, config, &mut summary)?;
    Ok(summary)
}

/// Phase A: sweep the root spool directory.
fn retry_enrichment(
    settings: &Settings,
    config: &ConfigView,
    summary: &mut RetrySummary,
) -> Result<(), RetryError> {
    let paths = spool::list(&settings.spool_path).map_err(RetryError::List)?;
    let mut ocr_engine = NullOcrEngine;
    let ocr_lang = config.get_string("ocr-lang", "eng");
    crate::ocr::with_c_numeric_locale(|| ocr_engine.init(&ocr_lang));

    for path in paths {
        let Ok(file_obj) = dicom::object::open_file(path.as_std_path()) else {
            continue;
        };
        let mut dataset: InMemDicomObject = file_obj.into_inner();

        let printer = dataset
            .element(RETIRED_PRINT_QUEUE_ID)
            .ok()
            .and_then(|e| e.to_str().ok())
            .map(|s| s.trim_end_matches('\0').to_string())
            .unwrap_or_default();

        if !enrichment::query(config, &printer, &mut dataset, &mut ocr_engine) {
            summary.still_pending += 1;
            continue;
        }
        summary.re_enriched += 1;

        let sop_class_uid = dataset
            .element_by_name("SOPClassUID")
            .ok()
            .and_then(|e| e.to_str().ok())
            .map(|s| s.trim_end_matches('\0').to_string())
            .unwrap_or_default();
        let sop_instance_uid = dataset
            .element_by_name("SOPInstanceUID")
            .ok()
            .and_then(|e| e.to_str().ok())
            .map(|s| s.trim_end_matches('\0').to_string())
            .unwrap_or_default();

        let mut scoped = config.clone();
        scoped.begin_group(&printer);
        let storage_servers = scoped.get_string_list("storage-servers");

        for server in &storage_servers {
            if let Err(error) =
                store_client::send_to_server(config, server, &dataset, &sop_class_uid, &sop_instance_uid)
            {
                tracing::warn!(%printer, server = %server, %error, "retry store to server failed, demoting");
                let server_dir = settings.spool_path.join(server);
                if let Err(error) = spool::save(&server_dir, &dataset) {
                    tracing::error!(%printer, server = %server, %error, "failed to demote spooled file");
                }
            }
        }

        spool::remove(&path);
    }
    Ok(())
}

/// Phase B: sweep each per-server demotion directory.
fn retry_storage(settings: &Settings, config: &ConfigView, summary: &mut RetrySummary) -> Result<(), RetryError> {
    let servers = config.child_groups();
    for server in servers {
        let server_dir = settings.spool_path.join(&server);
        let paths = spool::list(&server_dir).map_err(RetryError::List)?;
        for path in paths {
            let Ok(file_obj) = dicom::object::open_file(path.as_std_path()) else {
                continue;
            };
            let dataset: InMemDicomObject = file_obj.into_inner();

            let sop_class_uid = dataset
                .element_by_name("SOPClassUID")
                .ok()
                .and_then(|e| e.to_str().ok())
                .map(|s| s.trim_end_matches('\0').to_string())
                .unwrap_or_default();
            let sop_instance_uid = dataset
                .element_by_name("SOPInstanceUID")
                .ok()
                .and_then(|e| e.to_str().ok())
                .map(|s| s.trim_end_matches('\0').to_string())
                .unwrap_or_default();

            match store_client::send_to_server(config, &server, &dataset, &sop_class_uid, &sop_instance_uid) {
                Ok(()) => {
                    spool::remove(&path);
                    summary.re_stored += 1;
                }
                Err(error) => {
                    tracing::debug!(server = %server, %error, "storage peer still unreachable");
                    summary.still_pending += 1;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use dicom::core::{DataElement, PrimitiveValue, VR};
    use dicom::dictionary_std::tags;

    fn settings_with_spool(dir: &Utf8PathBuf) -> Settings {
        Settings {
            config_path: dir.join("vdicomprint.toml"),
            port: 11120,
            aetitle: "VIRTUALPRINTER".to_string(),
            max_associations: std::num::NonZeroUsize::new(4).unwrap(),
            timeout: std::time::Duration::from_secs(30),
            spool_path: dir.clone(),
            spool_interval: std::time::Duration::from_secs(600),
            log_level: "info".to_string(),
            storage_servers: Vec::new(),
        }
    }

    #[test]
    fn sweep_with_no_enrichment_url_configured_leaves_files_spooled() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = camino::Utf8Path::from_path(tmp.path()).unwrap().to_path_buf();
        let settings = settings_with_spool(&dir);
        let config = ConfigView::load(settings.config_path.clone()).unwrap();

        let mut dataset = InMemDicomObject::new_empty();
        dataset.put(DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from("1.2.840.10008.5.1.1.9"),
        ));
        dataset.put(DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from("1.2.3.4")));
        spool::save(&dir, &dataset).unwrap();

        let summary = run_once(&settings, &config).unwrap();
        assert_eq!(summary.re_enriched, 1);
        assert_eq!(spool::list(&dir).unwrap().len(), 0);
    }

    #[test]
    fn empty_spool_directory_is_a_no_op() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = camino::Utf8Path::from_path(tmp.path()).unwrap().to_path_buf();
        let settings = settings_with_spool(&dir);
        let config = ConfigView::load(settings.config_path.clone()).unwrap();

        let summary = run_once(&settings, &config).unwrap();
        assert!(!summary.is_active());
    }
}
