//! Per-association Print Management state.
//!
//! `PrintSession` is the single owned piece of mutable state threaded
//! through one accepted association's command dispatch. It replaces the
//! C++ original's `PrintSCP` instance fields with one struct so that
//! `session_dataset`'s merge rule (§4.6.2: all non-sequence elements,
//! last write wins) has exactly one call site instead of being
//! re-implemented at every N-CREATE/N-SET handler.

use std::time::Duration;

use dicom::core::VR;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;

use crate::dicom_tags;

/// Requested film session already exists for this association.
#[derive(Debug, thiserror::Error)]
#[error("a Basic Film Session is already open for this association")]
pub struct DuplicateFilmSessionError;

pub struct PrintSession {
    /// Called-AE title; identifies which config group governs this
    /// session (printer identity).
    pub printer: String,
    pub study_uid: Option<String>,
    pub series_uid: Option<String>,
    pub sop_instance_uid: Option<String>,
    /// Accumulates every non-sequence element seen in request/response
    /// datasets, merged into every outgoing image box per §4.6.4 step 5.
    pub session_dataset: InMemDicomObject,
    pub blocking_mode: bool,
    pub timeout: Duration,
    pub force_unique_series: bool,
    pub force_unique_study: bool,
}

impl PrintSession {
    /// Start a session for an accepted association, seeding
    /// `session_dataset` per §4.6.1: destination AE, and the safe
    /// `PatientID`/`PatientName` defaults later overwritten by
    /// enrichment (successful or not).
    pub fn new(
        printer: impl Into<String>,
        destination_ae: &str,
        blocking_mode: bool,
        timeout: Duration,
        force_unique_series: bool,
        force_unique_study: bool,
    ) -> Self {
        let mut session_dataset = InMemDicomObject::new_empty();
        session_dataset.put(dicom::core::DataElement::new(
            dicom_tags::RETIRED_DESTINATION_AE,
            VR::AE,
            dicom::core::PrimitiveValue::from(destination_ae.to_string()),
        ));
        session_dataset.put(dicom::core::DataElement::new(
            tags::PATIENT_ID,
            VR::LO,
            dicom::core::PrimitiveValue::from("0".to_string()),
        ));
        session_dataset.put(dicom::core::DataElement::new(
            tags::PATIENT_NAME,
            VR::PN,
            dicom::core::PrimitiveValue::from("^".to_string()),
        ));

        Self {
            printer: printer.into(),
            study_uid: None,
            series_uid: None,
            sop_instance_uid: None,
            session_dataset,
            blocking_mode,
            timeout,
            force_unique_series,
            force_unique_study,
        }
    }

    /// Merge every non-sequence element of `src` into `session_dataset`,
    /// overwriting any existing value for the same tag. Called after
    /// dispatching any command except image-box N-SET (§4.6.2).
    pub fn merge_non_sequence(&mut self, src: &InMemDicomObject) {
        for element in src {
            if element.header().vr() == VR::SQ {
                continue;
            }
            self.session_dataset.put(element.clone());
        }
    }

    /// Whether a Basic Film Session is currently open.
    pub fn has_film_session(&self) -> bool {
        self.study_uid.is_some()
    }

    /// N-CREATE(BasicFilmSession): §4.6.5. Fails if one is already open.
    pub fn open_film_session(&mut self, study_uid: String) -> Result<(), DuplicateFilmSessionError> {
        if self.has_film_session() {
            return Err(DuplicateFilmSessionError);
        }
        self.study_uid = Some(study_uid);
        Ok(())
    }

    /// N-CREATE(BasicFilmBox): records the series identifier.
    pub fn open_film_box(&mut self, series_uid: String) {
        self.series_uid = Some(series_uid);
    }

    /// N-DELETE(BasicFilmSession): unconditionally clears session, film
    /// box and instance identifiers (the non-strict variant of §9's open
    /// question; see `strict_film_session_delete` in `scp.rs` for the
    /// gated alternative).
    pub fn close_film_session(&mut self) {
        self.study_uid = None;
        self.series_uid = None;
        self.sop_instance_uid = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> PrintSession {
        PrintSession::new("P1", "P1", true, Duration::from_secs(30), false, false)
    }

    #[test]
    fn seeds_safe_patient_defaults() {
        let s = session();
        let id = s.session_dataset.element(tags::PATIENT_ID).unwrap();
        assert_eq!(id.to_str().unwrap(), "0");
        let name = s.session_dataset.element(tags::PATIENT_NAME).unwrap();
        assert_eq!(name.to_str().unwrap(), "^");
    }

    #[test]
    fn second_film_session_is_rejected_until_delete() {
        let mut s = session();
        s.open_film_session("1.2.3".to_string()).unwrap();
        assert!(s.open_film_session("1.2.4".to_string()).is_err());
        s.close_film_session();
        assert!(s.open_film_session("1.2.5".to_string()).is_ok());
    }

    #[test]
    fn merge_skips_sequence_elements() {
        let mut s = session();
        let mut src = InMemDicomObject::new_empty();
        src.put(dicom::core::DataElement::new(
            tags::STUDY_DESCRIPTION,
            VR::LO,
            dicom::core::PrimitiveValue::from("CT chest".to_string()),
        ));
        s.merge_non_sequence(&src);
        assert_eq!(
            s.session_dataset
                .element(tags::STUDY_DESCRIPTION)
                .unwrap()
                .to_str()
                .unwrap(),
            "CT chest"
        );
    }
}
