//! Tag identifiers not present in the standard DICOM dictionary.
//!
//! The upstream DCMTK-derived implementation this service is modeled on
//! repurposes a block of the (0009,eeee) private group to carry two pieces
//! of session bookkeeping across the enrichment/spool pipeline: which
//! destination AE a stored instance was printed for, and which printer
//! identity a spooled instance should be re-enriched as. Neither has a
//! standard public tag, so they are declared here the same way
//! `private_sop_uids.rs` declares private SOP class UIDs.

use dicom::core::{DataDictionary, DataElement, PrimitiveValue, Tag};
use dicom::dictionary_std::StandardDataDictionary;
use dicom::object::InMemDicomObject;

/// Destination AE title, recorded on every dataset that passes through a
/// `PrintSession` so that the image-box storage path and the retry worker
/// know which storage routing applied.
pub const RETIRED_DESTINATION_AE: Tag = Tag(0x0009, 0x0010);

/// Name of the print queue (printer group) an image box was spooled under,
/// read back by the retry worker's "re-enrich" phase to pick the correct
/// printer config group.
pub const RETIRED_PRINT_QUEUE_ID: Tag = Tag(0x0009, 0x0011);

/// Write `text` into `dataset` under the tag whose standard dictionary
/// alias is `key`, coercing the value representation's virtual VR down to
/// a concrete one. Unknown aliases are a no-op; the caller logs.
///
/// Shared by the enrichment client (§4.4 step 9) and the OCR tagger
/// (§4.5), both of which resolve a config-supplied tag name against the
/// dataset at write time rather than at config-load time.
pub fn write_named_tag(dataset: &mut InMemDicomObject, key: &str, text: &str) -> bool {
    let Some(entry) = StandardDataDictionary.by_name(key) else {
        return false;
    };
    let tag = entry.tag.inner();
    let vr = entry.vr.relaxed();
    dataset.put(DataElement::new(tag, vr, PrimitiveValue::from(text)));
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_known_alias() {
        let mut obj = InMemDicomObject::new_empty();
        assert!(write_named_tag(&mut obj, "PatientName", "DOE^JANE"));
        assert_eq!(
            obj.element(dicom::dictionary_std::tags::PATIENT_NAME)
                .unwrap()
                .to_str()
                .unwrap(),
            "DOE^JANE"
        );
    }

    #[test]
    fn unknown_alias_is_noop() {
        let mut obj = InMemDicomObject::new_empty();
        assert!(!write_named_tag(&mut obj, "NotARealTagName", "x"));
        assert_eq!(obj.iter().count(), 0);
    }
}
