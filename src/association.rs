//! Association negotiation, and the DIMSE command/dataset framing built
//! on top of a negotiated association.
//!
//! `dicom-ul`'s high-level `ServerAssociationOptions`/`ClientAssociationOptions`
//! cover the common single-purpose case (one SCU, one abstract syntax) but
//! fall short of two things this service needs: routing an accepted
//! association to the right printer config group by its *called* AE title
//! (the high-level server association keeps only the calling AE title once
//! negotiation is done), and opening several simultaneous presentation
//! contexts on one upstream leg for the proxy path (§4.6.1 upstream
//! paragraph). Both are plain requirements on the A-ASSOCIATE-RQ/AC
//! exchange, so this module negotiates it directly against the `pdu`
//! primitives `dicom-ul` already exposes publicly, and keeps the rest of
//! the association (PDU framing, release, abort) next to it. `store_client.rs`
//! does not need any of this -- it only ever proposes one context -- and
//! keeps using `ClientAssociationOptions`.

use std::net::TcpStream;

use dicom::dictionary_std::tags;
use dicom::encoding::transfer_syntax::TransferSyntaxIndex;
use dicom::object::InMemDicomObject;
use dicom::transfer_syntax::{TransferSyntax, TransferSyntaxRegistry};
use dicom::ul::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, AssociationRJResult, AssociationRJServiceUserReason,
    AssociationRJSource, PDataValue, PDataValueType, Pdu, PresentationContextProposed,
    PresentationContextResult, PresentationContextResultReason, UserVariableItem,
};
use dicom::ul::{read_pdu, write_pdu, IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

use crate::scp_error::ScpError;

/// `DICOM_STDAPPLICATIONCONTEXT`, the only application context name this
/// service (and the printers it proxies to) ever negotiates (§4.6.1).
pub const APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

/// Look up the accepted transfer syntax for a presentation context id, as
/// negotiated during association establishment.
pub fn transfer_syntax_for<'a>(
    contexts: &'a [PresentationContextResult],
    presentation_context_id: u8,
) -> Result<&'static TransferSyntax, ScpError> {
    let context = contexts
        .iter()
        .find(|pc| pc.id == presentation_context_id)
        .ok_or(ScpError::MissingPresentationContext)?;
    TransferSyntaxRegistry
        .get(&context.transfer_syntax)
        .ok_or_else(|| ScpError::NoTransferSyntaxMatch(context.transfer_syntax.clone()))
}

/// The preferred transfer syntax proposal order used both for accepting
/// incoming associations (§4.6.1) and for opening the upstream leg in
/// proxy mode (§4.6.1, upstream paragraph): native-endian Explicit VR,
/// opposite-endian Explicit VR, Implicit VR Little Endian.
pub fn preferred_transfer_syntaxes() -> [&'static str; 3] {
    use dicom::dictionary_std::uids;
    if cfg!(target_endian = "big") {
        [
            uids::EXPLICIT_VR_BIG_ENDIAN,
            uids::EXPLICIT_VR_LITTLE_ENDIAN,
            uids::IMPLICIT_VR_LITTLE_ENDIAN,
        ]
    } else {
        [
            uids::EXPLICIT_VR_LITTLE_ENDIAN,
            uids::EXPLICIT_VR_BIG_ENDIAN,
            uids::IMPLICIT_VR_LITTLE_ENDIAN,
        ]
    }
}

/// Policy an acceptor negotiates incoming associations against (§4.6.1).
pub struct AcceptPolicy<'a> {
    pub max_pdu_length: u32,
    pub strict: bool,
    pub abstract_syntaxes: &'a [&'a str],
    pub transfer_syntaxes: &'a [&'a str],
}

/// One DIMSE command, optionally followed by a dataset, read off a live
/// association. `command_bytes`/`dataset_bytes` are the exact wire bytes
/// (Implicit VR LE for the command, the negotiated transfer syntax for
/// the dataset) so the proxy path (C7) can re-emit them upstream/downstream
/// without a decode/re-encode round trip.
pub struct ReceivedMessage {
    pub presentation_context_id: u8,
    pub command: InMemDicomObject,
    pub command_bytes: Vec<u8>,
    pub dataset_bytes: Option<Vec<u8>>,
}

/// What `Association::receive_message` saw.
pub enum SessionEvent {
    Message(ReceivedMessage),
    /// The peer requested a graceful release (`A-RELEASE-RQ`).
    Released,
}

/// A negotiated DICOM association, either accepted from an incoming
/// connection or opened toward an upstream printer (§3 "Association").
pub struct Association {
    socket: TcpStream,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub contexts: Vec<PresentationContextResult>,
    pub max_pdu_length: u32,
    strict: bool,
}

impl Association {
    pub fn transfer_syntax_for(&self, presentation_context_id: u8) -> Result<&'static TransferSyntax, ScpError> {
        transfer_syntax_for(&self.contexts, presentation_context_id)
    }

    fn send_pdu(&mut self, pdu: &Pdu) -> Result<(), ScpError> {
        write_pdu(&mut self.socket, pdu).map_err(ScpError::PduWrite)
    }

    fn receive_pdu(&mut self) -> Result<Pdu, ScpError> {
        read_pdu(&mut self.socket, self.max_pdu_length, self.strict).map_err(ScpError::PduRead)
    }

    /// Read one DIMSE command (plus dataset, if the command carries one),
    /// reassembling however many `P-DATA-TF` PDUs the peer split it over.
    pub fn receive_message(&mut self) -> Result<SessionEvent, ScpError> {
        let mut command_buf = Vec::new();
        let mut dataset_buf = Vec::new();
        let mut pc_id = None;
        let mut pending_command: Option<InMemDicomObject> = None;

        loop {
            match self.receive_pdu()? {
                Pdu::PData { data } => {
                    for value in data {
                        pc_id.get_or_insert(value.presentation_context_id);
                        match value.value_type {
                            PDataValueType::Command => {
                                command_buf.extend_from_slice(&value.data);
                                if value.is_last {
                                    let ts = dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN
                                        .erased();
                                    let command =
                                        InMemDicomObject::read_dataset_with_ts(command_buf.as_slice(), &ts)
                                            .map_err(ScpError::FailedToReadCommand)?;
                                    let expect_dataset = command
                                        .element(tags::COMMAND_DATA_SET_TYPE)
                                        .ok()
                                        .and_then(|e| e.uint16().ok())
                                        .map(|t| t != 0x0101)
                                        .unwrap_or(false);
                                    if !expect_dataset {
                                        return Ok(SessionEvent::Message(ReceivedMessage {
                                            presentation_context_id: pc_id.unwrap(),
                                            command,
                                            command_bytes: command_buf,
                                            dataset_bytes: None,
                                        }));
                                    }
                                    pending_command = Some(command);
                                }
                            }
                            PDataValueType::Data => {
                                dataset_buf.extend_from_slice(&value.data);
                                if value.is_last {
                                    let command = pending_command.take().ok_or(ScpError::CannotRespond(
                                        "dataset PDV arrived before a complete command",
                                    ))?;
                                    return Ok(SessionEvent::Message(ReceivedMessage {
                                        presentation_context_id: pc_id.unwrap(),
                                        command,
                                        command_bytes: command_buf,
                                        dataset_bytes: Some(dataset_buf),
                                    }));
                                }
                            }
                        }
                    }
                }
                Pdu::ReleaseRQ => return Ok(SessionEvent::Released),
                Pdu::AbortRQ { .. } => return Err(ScpError::PeerAbort),
                _ => return Err(ScpError::CannotRespond("unexpected PDU mid-session")),
            }
        }
    }

    /// Send a command set (Implicit VR LE) and, if given, a dataset
    /// encoded with `dataset_ts`, as a single `P-DATA-TF` each.
    pub fn send_message(
        &mut self,
        presentation_context_id: u8,
        command: &InMemDicomObject,
        dataset: Option<(&InMemDicomObject, &TransferSyntax)>,
    ) -> Result<(), ScpError> {
        let implicit_vr = dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
        let mut command_bytes = Vec::new();
        command
            .write_dataset_with_ts(&mut command_bytes, &implicit_vr)
            .map_err(|_| ScpError::CannotRespond("failed to encode command set"))?;

        if let Some((dataset, ts)) = dataset {
            let mut dataset_bytes = Vec::new();
            dataset
                .write_dataset_with_ts(&mut dataset_bytes, ts)
                .map_err(|_| ScpError::CannotRespond("failed to encode dataset"))?;
            self.send_raw(presentation_context_id, &command_bytes, Some(&dataset_bytes))
        } else {
            self.send_raw(presentation_context_id, &command_bytes, None)
        }
    }

    /// Forward already-encoded command/dataset bytes verbatim, used by the
    /// proxy path (C7) to splice responses without a decode/re-encode
    /// round trip.
    pub fn send_raw(
        &mut self,
        presentation_context_id: u8,
        command_bytes: &[u8],
        dataset_bytes: Option<&[u8]>,
    ) -> Result<(), ScpError> {
        self.send_pdu(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: command_bytes.to_vec(),
            }],
        })?;
        if let Some(bytes) = dataset_bytes {
            self.send_pdu(&Pdu::PData {
                data: vec![PDataValue {
                    presentation_context_id,
                    value_type: PDataValueType::Data,
                    is_last: true,
                    data: bytes.to_vec(),
                }],
            })?;
        }
        Ok(())
    }

    /// Release as the acceptor: the peer sends `A-RELEASE-RQ` (consumed by
    /// `receive_message` returning `SessionEvent::Released`), we answer
    /// with `A-RELEASE-RP`.
    pub fn release_as_acceptor(&mut self) -> Result<(), ScpError> {
        self.send_pdu(&Pdu::ReleaseRP)
    }

    /// Release as the requestor: used for the upstream leg in proxy mode.
    pub fn release_as_requestor(&mut self) -> Result<(), ScpError> {
        self.send_pdu(&Pdu::ReleaseRQ)?;
        match self.receive_pdu()? {
            Pdu::ReleaseRP => Ok(()),
            _ => Err(ScpError::CannotRespond("peer did not answer release with A-RELEASE-RP")),
        }
    }

    pub fn abort(&mut self) {
        let _ = self.send_pdu(&Pdu::AbortRQ {
            source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::ReasonNotSpecifiedUnrecognizedPDU),
        });
    }
}

/// Negotiate an incoming association per §4.6.1. `printer_exists` resolves
/// a called AE title to whether a config group for it exists; `is_shutdown_sop_class`
/// flags the private SOP class that requests supervisor termination. On
/// any rejection, the appropriate A-ASSOCIATE-RJ has already been written
/// to `socket` before this returns `Err`.
pub fn accept(
    mut socket: TcpStream,
    policy: &AcceptPolicy,
    printer_exists: impl Fn(&str) -> bool,
    is_shutdown_sop_class: impl Fn(&str) -> bool,
) -> Result<Association, ScpError> {
    let strict = policy.strict;
    let request = read_pdu(&mut socket, policy.max_pdu_length, strict).map_err(ScpError::PduRead)?;

    let Pdu::AssociationRQ {
        calling_ae_title,
        called_ae_title,
        application_context_name,
        presentation_contexts,
        ..
    } = request
    else {
        abort_unexpected(&mut socket);
        return Err(ScpError::CannotRespond("expected an A-ASSOCIATE-RQ"));
    };

    let calling_ae_title = calling_ae_title.trim().to_string();
    let called_ae_title = called_ae_title.trim().to_string();

    if application_context_name.trim() != APPLICATION_CONTEXT_NAME {
        reject(
            &mut socket,
            AssociationRJResult::Transient,
            AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
        )?;
        return Err(ScpError::AssociationRejected(
            AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
        ));
    }

    if !printer_exists(&called_ae_title) {
        reject(
            &mut socket,
            AssociationRJResult::Transient,
            AssociationRJServiceUserReason::CalledAETitleNotRecognized,
        )?;
        return Err(ScpError::AssociationRejected(
            AssociationRJServiceUserReason::CalledAETitleNotRecognized,
        ));
    }

    if presentation_contexts
        .iter()
        .any(|pc| is_shutdown_sop_class(pc.abstract_syntax.trim()))
    {
        reject(
            &mut socket,
            AssociationRJResult::Permanent,
            AssociationRJServiceUserReason::NoReasonGiven,
        )?;
        return Err(ScpError::ShutdownRequested);
    }

    let negotiated: Vec<PresentationContextResult> = presentation_contexts
        .iter()
        .map(|pc| negotiate_one(pc, policy))
        .collect();

    let ac = Pdu::AssociationAC {
        protocol_version: 1,
        application_context_name: application_context_name.clone(),
        presentation_contexts: negotiated.clone(),
        calling_ae_title: calling_ae_title.clone(),
        called_ae_title: called_ae_title.clone(),
        user_variables: vec![
            UserVariableItem::MaxLength(policy.max_pdu_length),
            UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
        ],
    };
    write_pdu(&mut socket, &ac).map_err(ScpError::PduWrite)?;

    Ok(Association {
        socket,
        calling_ae_title,
        called_ae_title,
        contexts: negotiated,
        max_pdu_length: policy.max_pdu_length,
        strict,
    })
}

fn negotiate_one(pc: &PresentationContextProposed, policy: &AcceptPolicy) -> PresentationContextResult {
    let abstract_syntax = pc.abstract_syntax.trim();
    if !policy.abstract_syntaxes.iter().any(|a| *a == abstract_syntax) {
        return PresentationContextResult {
            id: pc.id,
            reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
            transfer_syntax: dicom::dictionary_std::uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
        };
    }
    let accepted = policy
        .transfer_syntaxes
        .iter()
        .find(|ts| pc.transfer_syntaxes.iter().any(|proposed| proposed.trim() == **ts));
    match accepted {
        Some(ts) => PresentationContextResult {
            id: pc.id,
            reason: PresentationContextResultReason::Acceptance,
            transfer_syntax: ts.to_string(),
        },
        None => PresentationContextResult {
            id: pc.id,
            reason: PresentationContextResultReason::TransferSyntaxesNotSupported,
            transfer_syntax: dicom::dictionary_std::uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
        },
    }
}

fn reject(
    socket: &mut TcpStream,
    result: AssociationRJResult,
    reason: AssociationRJServiceUserReason,
) -> Result<(), ScpError> {
    let pdu = Pdu::AssociationRJ {
        result,
        source: AssociationRJSource::ServiceUser(reason),
    };
    write_pdu(socket, &pdu).map_err(ScpError::PduWrite)
}

fn abort_unexpected(socket: &mut TcpStream) {
    let _ = write_pdu(
        socket,
        &Pdu::AbortRQ {
            source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPDU),
        },
    );
}

/// Open an upstream leg in proxy mode (§4.6.1 upstream paragraph),
/// proposing one presentation context per `(id, abstract_syntax)` pair
/// (ids `1, 3, 5, ...`) with the same transfer-syntax fallback list used
/// for the downstream accept.
pub fn connect(
    address: &str,
    port: u16,
    calling_ae_title: &str,
    called_ae_title: &str,
    abstract_syntaxes: &[(u8, &str)],
    transfer_syntaxes: &[&str],
    max_pdu_length: u32,
) -> Result<Association, ScpError> {
    let mut socket = TcpStream::connect((address, port)).map_err(ScpError::Connect)?;

    let presentation_contexts = abstract_syntaxes
        .iter()
        .map(|(id, uid)| PresentationContextProposed {
            id: *id,
            abstract_syntax: uid.to_string(),
            transfer_syntaxes: transfer_syntaxes.iter().map(|s| s.to_string()).collect(),
        })
        .collect();

    let rq = Pdu::AssociationRQ {
        protocol_version: 1,
        calling_ae_title: calling_ae_title.to_string(),
        called_ae_title: called_ae_title.to_string(),
        application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
        presentation_contexts,
        user_variables: vec![UserVariableItem::MaxLength(max_pdu_length)],
    };
    write_pdu(&mut socket, &rq).map_err(ScpError::PduWrite)?;

    match read_pdu(&mut socket, max_pdu_length, false).map_err(ScpError::PduRead)? {
        Pdu::AssociationAC {
            presentation_contexts,
            calling_ae_title,
            ..
        } => Ok(Association {
            socket,
            calling_ae_title,
            called_ae_title: called_ae_title.to_string(),
            contexts: presentation_contexts,
            max_pdu_length,
            strict: false,
        }),
        Pdu::AssociationRJ { result, source } => Err(ScpError::UpstreamRejected { result, source }),
        _ => Err(ScpError::CannotRespond("unexpected PDU from upstream during negotiation")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preferred_order_puts_native_explicit_vr_first() {
        let order = preferred_transfer_syntaxes();
        assert_eq!(order[2], dicom::dictionary_std::uids::IMPLICIT_VR_LITTLE_ENDIAN);
        assert_ne!(order[0], order[1]);
    }

    #[test]
    fn negotiate_one_rejects_unlisted_abstract_syntax() {
        let policy = AcceptPolicy {
            max_pdu_length: 16384,
            strict: false,
            abstract_syntaxes: &["1.2.840.10008.1.1"],
            transfer_syntaxes: &["1.2.840.10008.1.2"],
        };
        let pc = PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.5.1.1.1".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        };
        let result = negotiate_one(&pc, &policy);
        assert_eq!(result.reason, PresentationContextResultReason::AbstractSyntaxNotSupported);
    }

    #[test]
    fn negotiate_one_accepts_matching_context() {
        let policy = AcceptPolicy {
            max_pdu_length: 16384,
            strict: false,
            abstract_syntaxes: &["1.2.840.10008.1.1"],
            transfer_syntaxes: &["1.2.840.10008.1.2.1", "1.2.840.10008.1.2"],
        };
        let pc = PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.1.1".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        };
        let result = negotiate_one(&pc, &policy);
        assert_eq!(result.reason, PresentationContextResultReason::Acceptance);
        assert_eq!(result.transfer_syntax, "1.2.840.10008.1.2");
    }
}
