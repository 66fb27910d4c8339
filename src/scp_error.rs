//! Errors raised while servicing one Print SCP association.
//!
//! This generalizes the receiver-side error enum the C-STORE-only listener
//! used (`CouldNotEstablish`/`PduReception`/`FailedToReadCommand`/...) to
//! the full Basic Grayscale Print Management DIMSE exchange: N-CREATE,
//! N-SET, N-ACTION, N-GET and N-DELETE against Film Session, Film Box,
//! Image Box and Printer SOP instances, in addition to the C-ECHO/C-STORE
//! verification and proxy paths.

use dicom::core::Tag;
use dicom::dictionary_std::StandardDataDictionary;
use dicom::ul::pdu::{AssociationRJResult, AssociationRJServiceUserReason, AssociationRJSource};

#[derive(thiserror::Error, Debug)]
pub enum ScpError {
    #[error("failed to read a PDU")]
    PduRead(#[source] dicom::ul::pdu::reader::Error),

    #[error("failed to write a PDU")]
    PduWrite(#[source] dicom::ul::pdu::WriteError),

    #[error("association rejected: {0:?}")]
    AssociationRejected(AssociationRJServiceUserReason),

    #[error("upstream association rejected: {result:?}/{source:?}")]
    UpstreamRejected {
        result: AssociationRJResult,
        source: AssociationRJSource,
    },

    #[error("could not connect to upstream printer")]
    Connect(#[source] std::io::Error),

    #[error("peer proposed the private shutdown SOP class")]
    ShutdownRequested,

    #[error("peer aborted the association")]
    PeerAbort,

    #[error("failed to read incoming DIMSE command")]
    FailedToReadCommand(#[source] dicom::object::ReadError),

    #[error("{0}")]
    CannotRespond(&'static str),

    #[error("missing {}", name_of(*.0))]
    MissingTag(Tag),

    #[error("value for {} is not a number", name_of(*.0))]
    InvalidNumber(Tag),

    #[error("missing presentation context")]
    MissingPresentationContext,

    #[error("no accepted presentation context for transfer syntax {0}")]
    NoTransferSyntaxMatch(String),

    #[error("failed to read DICOM data object")]
    FailedToReadObject(#[from] dicom::object::ReadError),

    #[error("unsupported DIMSE command field {0:#06x}")]
    UnsupportedCommandField(u16),
}

/// Render a tag's standard dictionary alias, falling back to its numeric
/// form for private/unrecognized tags.
fn name_of(tag: Tag) -> String {
    StandardDataDictionary
        .by_tag(tag)
        .map(|e| e.alias.to_string())
        .unwrap_or_else(|| format!("{tag}"))
}
