//! On-disk spool directory: one file per pending instance.
//!
//! Grounded on the teacher's `write_dicom`/`store_dicom` pair in `writer.rs`
//! (`fs_err::create_dir_all` + `InMemDicomObject::write_to_file`), generalized
//! from a fixed CUBE-registration path layout to the flat `name (N).dcm`
//! collision scheme the retry loop relies on.

use camino::{Utf8Path, Utf8PathBuf};
use dicom::encoding::transfer_syntax::TransferSyntaxIndex;
use dicom::object::mem::InMemDicomObject;
use dicom::object::FileMetaTableBuilder;
use dicom::transfer_syntax::TransferSyntaxRegistry;

use crate::sanitize::sanitize_path;

const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";

#[derive(thiserror::Error, Debug)]
pub enum SpoolError {
    #[error("dataset has no SOP Instance UID")]
    MissingSopInstanceUid,

    #[error("could not create spool directory {0}")]
    CreateDir(Utf8PathBuf, #[source] std::io::Error),

    #[error("could not build file meta information")]
    Meta(#[source] dicom::object::meta::Error),

    #[error("could not write spool file {0}")]
    Write(Utf8PathBuf, #[source] dicom::object::WriteError),
}

/// Persist `dataset` under `dir`, naming the file after its SOP Instance UID.
///
/// If a file by that name already exists, ` (N)` is appended for the
/// smallest `N >= 2` that names a free path. Returns the path actually
/// written to.
pub fn save(dir: &Utf8Path, dataset: &InMemDicomObject) -> Result<Utf8PathBuf, SpoolError> {
    let sop_instance_uid = dataset
        .element_by_name("SOPInstanceUID")
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches('\0').to_string())
        .filter(|s| !s.is_empty())
        .ok_or(SpoolError::MissingSopInstanceUid)?;

    fs_err::create_dir_all(dir).map_err(|e| SpoolError::CreateDir(dir.to_owned(), e))?;

    let stem = sanitize_path(&sop_instance_uid);
    let path = free_path(dir, &stem);

    let sop_class_uid = dataset
        .element_by_name("SOPClassUID")
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches('\0').to_string())
        .unwrap_or_default();

    let ts = TransferSyntaxRegistry
        .get(EXPLICIT_VR_LITTLE_ENDIAN)
        .expect("Explicit VR Little Endian is a standard transfer syntax");

    let meta = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(sop_class_uid)
        .media_storage_sop_instance_uid(sop_instance_uid)
        .transfer_syntax(ts.uid())
        .build()
        .map_err(SpoolError::Meta)?;

    let file_obj = dataset.clone().with_exact_meta(meta);
    file_obj
        .write_to_file(&path)
        .map_err(|e| SpoolError::Write(path.clone(), e))?;
    Ok(path)
}

/// Find the first unused `<dir>/<stem>.dcm`, `<dir>/<stem> (2).dcm`, ... path.
fn free_path(dir: &Utf8Path, stem: &str) -> Utf8PathBuf {
    let first = dir.join(format!("{stem}.dcm"));
    if !first.exists() {
        return first;
    }
    let mut n: u32 = 2;
    loop {
        let candidate = dir.join(format!("{stem} ({n}).dcm"));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Yield the regular files directly inside `dir`, in directory order.
///
/// A missing directory yields an empty iterator rather than an error: the
/// retry worker treats "nothing spooled yet" identically to "spool is empty".
pub fn list(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, std::io::Error> {
    let entries = match fs_err::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            if let Ok(path) = Utf8PathBuf::try_from(entry.path()) {
                paths.push(path);
            }
        }
    }
    Ok(paths)
}

/// Delete `path`, returning whether it was actually removed.
pub fn remove(path: &Utf8Path) -> bool {
    fs_err::remove_file(path).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom::core::{DataElement, PrimitiveValue, VR};
    use dicom::dictionary_std::tags;

    fn dataset_with_uid(uid: &str) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from("1.2.840.10008.5.1.1.9"),
        ));
        obj.put(DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(uid),
        ));
        obj
    }

    #[test]
    fn saves_under_sop_instance_uid() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let dataset = dataset_with_uid("1.2.3.4");
        let path = save(dir, &dataset).unwrap();
        assert_eq!(path.file_name(), Some("1.2.3.4.dcm"));
        assert!(path.exists());
    }

    #[test]
    fn collides_on_repeat_save_and_suffixes() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let dataset = dataset_with_uid("1.2.3.4");
        let first = save(dir, &dataset).unwrap();
        let second = save(dir, &dataset).unwrap();
        assert_ne!(first, second);
        assert_eq!(second.file_name(), Some("1.2.3.4 (2).dcm"));
    }

    #[test]
    fn missing_sop_instance_uid_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let dataset = InMemDicomObject::new_empty();
        let err = save(dir, &dataset).unwrap_err();
        assert!(matches!(err, SpoolError::MissingSopInstanceUid));
    }

    #[test]
    fn list_is_empty_for_missing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap().join("nope");
        assert!(list(&dir).unwrap().is_empty());
    }

    #[test]
    fn list_then_remove_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(tmp.path()).unwrap();
        let dataset = dataset_with_uid("1.2.3.4");
        let path = save(dir, &dataset).unwrap();
        let listed = list(dir).unwrap();
        assert_eq!(listed, vec![path.clone()]);
        assert!(remove(&path));
        assert!(list(dir).unwrap().is_empty());
    }
}
