//! DIMSE command construction and parsing.
//!
//! The Enet4 `storescp` example this service started from only ever needed
//! to build two command sets by hand (C-ECHO-RSP, C-STORE-RSP) via
//! `InMemDicomObject::command_from_element_iter`; `dicom-ul` has no typed
//! helpers for the N-* message types Print Management relies on. Rather
//! than special-case each one the way the original did, [`DimseRequest`]
//! generalizes the pattern the original used for its two commands into one
//! parse path, and [`DimseResponseBuilder`] generalizes response
//! construction the same way.

use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::{tags, StandardDataDictionary};
use dicom::object::InMemDicomObject;

use crate::scp_error::ScpError;

/// DIMSE command field values relevant to Print Management, Verification
/// and Storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandField {
    CStoreRq,
    CStoreRsp,
    CEchoRq,
    CEchoRsp,
    NGetRq,
    NGetRsp,
    NSetRq,
    NSetRsp,
    NActionRq,
    NActionRsp,
    NCreateRq,
    NCreateRsp,
    NDeleteRq,
    NDeleteRsp,
    CCancelRq,
}

impl CommandField {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0x0001 => Self::CStoreRq,
            0x8001 => Self::CStoreRsp,
            0x0030 => Self::CEchoRq,
            0x8030 => Self::CEchoRsp,
            0x0010 => Self::NGetRq,
            0x8010 => Self::NGetRsp,
            0x0020 => Self::NSetRq,
            0x8020 => Self::NSetRsp,
            0x0050 => Self::NActionRq,
            0x8050 => Self::NActionRsp,
            0x0110 => Self::NCreateRq,
            0x8110 => Self::NCreateRsp,
            0x0060 => Self::NDeleteRq,
            0x8060 => Self::NDeleteRsp,
            0x0FFF => Self::CCancelRq,
            _ => return None,
        })
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::CStoreRq => 0x0001,
            Self::CStoreRsp => 0x8001,
            Self::CEchoRq => 0x0030,
            Self::CEchoRsp => 0x8030,
            Self::NGetRq => 0x0010,
            Self::NGetRsp => 0x8010,
            Self::NSetRq => 0x0020,
            Self::NSetRsp => 0x8020,
            Self::NActionRq => 0x0050,
            Self::NActionRsp => 0x8050,
            Self::NCreateRq => 0x0110,
            Self::NCreateRsp => 0x8110,
            Self::NDeleteRq => 0x0060,
            Self::NDeleteRsp => 0x8060,
            Self::CCancelRq => 0x0FFF,
        }
    }

    /// Whether a dataset accompanies this request per the standard (rather
    /// than the `CommandDataSetType` element, which some SCUs set
    /// incorrectly for N-CREATE/N-SET when the dataset is empty).
    pub fn rsp_for(self) -> Self {
        match self {
            Self::CStoreRq => Self::CStoreRsp,
            Self::CEchoRq => Self::CEchoRsp,
            Self::NGetRq => Self::NGetRsp,
            Self::NSetRq => Self::NSetRsp,
            Self::NActionRq => Self::NActionRsp,
            Self::NCreateRq => Self::NCreateRsp,
            Self::NDeleteRq => Self::NDeleteRsp,
            other => other,
        }
    }
}

/// Well-known DIMSE status codes used by the Print Management dispatch.
pub mod status {
    pub const SUCCESS: u16 = 0x0000;
    pub const PROCESSING_FAILURE: u16 = 0x0110;
    pub const NO_SUCH_ATTRIBUTE: u16 = 0x0105;
    pub const INVALID_ATTRIBUTE_VALUE: u16 = 0x0106;
    pub const NO_SUCH_OBJECT_INSTANCE: u16 = 0x0112;
    pub const DUPLICATE_SOP_INSTANCE: u16 = 0x0111;
    pub const NO_SUCH_ACTION_TYPE: u16 = 0x0115;
    pub const NO_SUCH_SOP_CLASS: u16 = 0x0118;
    pub const MISSING_ATTRIBUTE: u16 = 0x0120;
    pub const MISSING_ATTRIBUTE_VALUE: u16 = 0x0121;
    pub const RESOURCE_LIMITATION: u16 = 0x0213;
    pub const WARNING_ATTRIBUTE_LIST_ERROR: u16 = 0x0001;
}

/// A parsed DIMSE request command, generalized across C-ECHO/C-STORE and
/// the Print Management N-* operations.
#[derive(Debug, Clone)]
pub struct DimseRequest {
    pub command: CommandField,
    pub message_id: u16,
    pub affected_sop_class_uid: Option<String>,
    pub affected_sop_instance_uid: Option<String>,
    pub requested_sop_class_uid: Option<String>,
    pub requested_sop_instance_uid: Option<String>,
    pub action_type_id: Option<u16>,
    pub has_dataset: bool,
}

impl DimseRequest {
    /// Parse a command set read in Implicit VR Little Endian, as carried
    /// on the Command presentation data value.
    pub fn parse(obj: &InMemDicomObject) -> Result<Self, ScpError> {
        let command_field = obj
            .element(tags::COMMAND_FIELD)
            .map_err(|_| ScpError::MissingTag(tags::COMMAND_FIELD))?
            .uint16()
            .map_err(|_| ScpError::InvalidNumber(tags::COMMAND_FIELD))?;
        let command = CommandField::from_u16(command_field)
            .ok_or(ScpError::UnsupportedCommandField(command_field))?;

        let message_id = obj
            .element(tags::MESSAGE_ID)
            .map_err(|_| ScpError::MissingTag(tags::MESSAGE_ID))?
            .uint16()
            .map_err(|_| ScpError::InvalidNumber(tags::MESSAGE_ID))?;

        let dataset_type = obj
            .element(tags::COMMAND_DATA_SET_TYPE)
            .ok()
            .and_then(|e| e.uint16().ok());
        let has_dataset = dataset_type.map(|t| t != 0x0101).unwrap_or(false);

        Ok(Self {
            command,
            message_id,
            affected_sop_class_uid: string_element(obj, tags::AFFECTED_SOP_CLASS_UID),
            affected_sop_instance_uid: string_element(obj, tags::AFFECTED_SOP_INSTANCE_UID),
            requested_sop_class_uid: string_element(obj, tags::REQUESTED_SOP_CLASS_UID),
            requested_sop_instance_uid: string_element(obj, tags::REQUESTED_SOP_INSTANCE_UID),
            action_type_id: obj
                .element(tags::ACTION_TYPE_ID)
                .ok()
                .and_then(|e| e.uint16().ok()),
            has_dataset,
        })
    }

    /// The SOP instance UID an N-GET/N-SET/N-ACTION/N-DELETE request
    /// addresses, falling back to the affected instance for N-CREATE.
    pub fn target_sop_instance_uid(&self) -> Option<&str> {
        self.requested_sop_instance_uid
            .as_deref()
            .or(self.affected_sop_instance_uid.as_deref())
    }
}

fn string_element(obj: &InMemDicomObject, tag: dicom::core::Tag) -> Option<String> {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok().map(|s| s.trim().to_string()))
}

/// Builds a DIMSE response command set, mirroring the identifiers of the
/// request it answers.
pub struct DimseResponseBuilder {
    command: CommandField,
    message_id_being_responded_to: u16,
    status: u16,
    affected_sop_class_uid: Option<String>,
    affected_sop_instance_uid: Option<String>,
    has_dataset: bool,
}

impl DimseResponseBuilder {
    pub fn for_request(request: &DimseRequest) -> Self {
        Self {
            command: request.command.rsp_for(),
            message_id_being_responded_to: request.message_id,
            status: status::SUCCESS,
            affected_sop_class_uid: request
                .affected_sop_class_uid
                .clone()
                .or_else(|| request.requested_sop_class_uid.clone()),
            affected_sop_instance_uid: request
                .affected_sop_instance_uid
                .clone()
                .or_else(|| request.requested_sop_instance_uid.clone()),
            has_dataset: false,
        }
    }

    pub fn status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn affected_sop_instance_uid(mut self, uid: impl Into<String>) -> Self {
        self.affected_sop_instance_uid = Some(uid.into());
        self
    }

    pub fn with_dataset(mut self) -> Self {
        self.has_dataset = true;
        self
    }

    /// Omit `AffectedSOPInstanceUID` from the response, used when a
    /// N-CREATE fails and no instance was actually created.
    pub fn clear_affected_sop_instance_uid(mut self) -> Self {
        self.affected_sop_instance_uid = None;
        self
    }

    pub fn build(self) -> InMemDicomObject<StandardDataDictionary> {
        let mut elements = vec![
            DataElement::new(
                tags::COMMAND_FIELD,
                VR::US,
                PrimitiveValue::from(self.command.to_u16()),
            ),
            DataElement::new(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                VR::US,
                PrimitiveValue::from(self.message_id_being_responded_to),
            ),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                PrimitiveValue::from(if self.has_dataset { 0x0102u16 } else { 0x0101u16 }),
            ),
            DataElement::new(tags::STATUS, VR::US, PrimitiveValue::from(self.status)),
        ];
        if let Some(uid) = self.affected_sop_class_uid {
            elements.push(DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                PrimitiveValue::from(uid),
            ));
        }
        if let Some(uid) = self.affected_sop_instance_uid {
            elements.push(DataElement::new(
                tags::AFFECTED_SOP_INSTANCE_UID,
                VR::UI,
                PrimitiveValue::from(uid),
            ));
        }
        InMemDicomObject::command_from_element_iter(elements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_field_round_trips() {
        for field in [
            CommandField::CStoreRq,
            CommandField::NCreateRq,
            CommandField::NSetRsp,
            CommandField::NDeleteRq,
        ] {
            assert_eq!(CommandField::from_u16(field.to_u16()), Some(field));
        }
    }

    #[test]
    fn response_builder_defaults_to_success_with_no_dataset() {
        let request = DimseRequest {
            command: CommandField::NCreateRq,
            message_id: 7,
            affected_sop_class_uid: Some("1.2.840.10008.5.1.1.1".to_string()),
            affected_sop_instance_uid: Some("1.2.3.4".to_string()),
            requested_sop_class_uid: None,
            requested_sop_instance_uid: None,
            action_type_id: None,
            has_dataset: true,
        };
        let rsp = DimseResponseBuilder::for_request(&request).build();
        assert_eq!(
            rsp.element(tags::COMMAND_FIELD).unwrap().uint16().unwrap(),
            CommandField::NCreateRsp.to_u16()
        );
        assert_eq!(rsp.element(tags::STATUS).unwrap().uint16().unwrap(), 0);
    }
}
