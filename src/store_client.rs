//! One-shot C-STORE SCU to a named storage peer (C2).

use std::time::Duration;

use dicom::core::header::HasLength;
use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use dicom::ul::association::ClientAssociationOptions;
use dicom::ul::pdu::{PDataValue, PDataValueType};
use dicom::ul::Pdu;

use crate::config::ConfigView;
use crate::dimse::{status, CommandField};

/// DICOM `Priority` value `LOW` (PS3.7 E.2), the priority this service
/// always issues outbound C-STORE-RQ with (§4.2).
const PRIORITY_LOW: u16 = 0x0002;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("missing \"{0}\" configuration for storage server \"{1}\"")]
    MissingConfig(&'static str, String),

    #[error("could not establish association with storage server \"{0}\"")]
    Association(String, #[source] dicom::ul::association::client::Error),

    #[error("no accepted presentation context for \"{0}\"")]
    NoContext(String),

    #[error("storage peer returned non-success status {status:#06x}: {detail}")]
    Dimse { status: u16, detail: String },

    #[error("failed to write dataset to the wire")]
    Write(#[source] dicom::object::WriteError),

    #[error("association I/O error")]
    Io(#[source] dicom::ul::association::client::Error),
}

/// Deliver `dataset` to the storage peer named by the `<server>` config
/// group `server_group` (keys: `aetitle`, `address`, `timeout`,
/// `store-port`, `store-pdu-size`, `store-aetitle`), per §4.2.
pub fn send_to_server(
    config: &ConfigView,
    server_group: &str,
    dataset: &InMemDicomObject,
    sop_class_uid: &str,
    sop_instance_uid: &str,
) -> Result<(), StoreError> {
    let mut config = config.clone();
    config.begin_group(server_group);
    let address = config.get_string("address", "");
    if address.is_empty() {
        return Err(StoreError::MissingConfig("address", server_group.to_string()));
    }
    let port = config.get_i64("store-port", 104) as u16;
    let our_aetitle = config.get_string("store-aetitle", "VIRTUALPRINTER");
    let peer_aetitle = config.get_string("aetitle", server_group);
    let timeout = config.get_i64("timeout", 30);
    let pdu_size = config.get_i64("store-pdu-size", 16384) as u32;
    config.end_group();

    let mut options = ClientAssociationOptions::new()
        .calling_ae_title(our_aetitle)
        .called_ae_title(peer_aetitle.clone())
        .with_abstract_syntax(sop_class_uid.to_string())
        .max_pdu_length(pdu_size);
    for ts in crate::association::preferred_transfer_syntaxes() {
        options = options.with_transfer_syntax(ts.to_string());
    }

    let mut association = options
        .establish((address.as_str(), port))
        .map_err(|e| StoreError::Association(server_group.to_string(), e))?;

    let transfer_syntax = dicom::transfer_syntax::TransferSyntaxRegistry
        .get(association.transfer_syntax_uid())
        .ok_or_else(|| StoreError::NoContext(server_group.to_string()))?;

    let message_id = 1u16;
    let command = InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            PrimitiveValue::from(CommandField::CStoreRq.to_u16()),
        ),
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(sop_class_uid.to_string()),
        ),
        DataElement::new(tags::MESSAGE_ID, VR::US, PrimitiveValue::from(message_id)),
        DataElement::new(tags::PRIORITY, VR::US, PrimitiveValue::from(PRIORITY_LOW)),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            PrimitiveValue::from(0x0102u16),
        ),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(sop_instance_uid.to_string()),
        ),
    ]);
    let mut command_bytes = Vec::new();
    let implicit_vr = dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    command
        .write_dataset_with_ts(&mut command_bytes, &implicit_vr)
        .map_err(StoreError::Write)?;

    let pc_id = association.presentation_context_id();
    association
        .send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: pc_id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: command_bytes,
            }],
        })
        .map_err(StoreError::Io)?;

    let mut dataset_bytes = Vec::new();
    dataset
        .write_dataset_with_ts(&mut dataset_bytes, transfer_syntax)
        .map_err(StoreError::Write)?;
    association
        .send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: pc_id,
                value_type: PDataValueType::Data,
                is_last: true,
                data: dataset_bytes,
            }],
        })
        .map_err(StoreError::Io)?;

    let rsp_pdu = association.receive().map_err(StoreError::Io)?;
    let status_code = read_rsp_status(&rsp_pdu)?;

    let _ = association.release();
    let _ = timeout;

    if status_code == status::SUCCESS {
        Ok(())
    } else {
        Err(StoreError::Dimse {
            status: status_code,
            detail: format!("C-STORE-RSP status {status_code:#06x} from {server_group}"),
        })
    }
}

fn read_rsp_status(pdu: &Pdu) -> Result<u16, StoreError> {
    let Pdu::PData { data } = pdu else {
        return Err(StoreError::Dimse {
            status: 0xFFFF,
            detail: "expected PData PDU carrying C-STORE-RSP".to_string(),
        });
    };
    let value = data.first().ok_or_else(|| StoreError::Dimse {
        status: 0xFFFF,
        detail: "empty PData PDU".to_string(),
    })?;
    let ts = dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let obj = InMemDicomObject::read_dataset_with_ts(value.data.as_slice(), &ts).map_err(|_| {
        StoreError::Dimse {
            status: 0xFFFF,
            detail: "could not parse C-STORE-RSP command set".to_string(),
        }
    })?;
    obj.element(tags::STATUS)
        .ok()
        .and_then(|e| e.uint16().ok())
        .ok_or_else(|| StoreError::Dimse {
            status: 0xFFFF,
            detail: "C-STORE-RSP missing Status".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_address_is_reported() {
        let config = ConfigView::load("/nonexistent/vdicomprint-test.toml").unwrap();
        let dataset = InMemDicomObject::new_empty();
        let err = send_to_server(&config, "S1", &dataset, "1.2.840.10008.5.1.4.1.1.7", "1.2.3");
        assert!(matches!(err, Err(StoreError::MissingConfig("address", _))));
    }
}
