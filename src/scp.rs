//! Print SCP state machine (C6) and upstream proxy path (C7).
//!
//! One call to [`handle_association`] services exactly one accepted
//! association end to end: negotiate, open an upstream leg if the
//! printer group configures one, then run either [`run_local`]'s
//! per-command dispatch or [`run_proxy`]'s command/dataset splice until
//! the peer releases, aborts, or a DIMSE error ends the session.

use std::net::TcpStream;
use std::time::Duration;

use camino::Utf8Path;
use dicom::core::value::Value as DicomValue;
use dicom::core::{DataDictionary, DataElement, Length, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::{tags, uids, StandardDataDictionary};
use dicom::object::InMemDicomObject;
use time::OffsetDateTime;

use crate::association::{self, AcceptPolicy, Association, SessionEvent};
use crate::config::ConfigView;
use crate::dicom_tags::{self, write_named_tag};
use crate::dimse::{status, CommandField, DimseRequest, DimseResponseBuilder};
use crate::enrichment;
use crate::ocr::{NullOcrEngine, OcrEngine};
use crate::private_sop_uids;
use crate::scp_error::ScpError;
use crate::session::PrintSession;
use crate::spool;
use crate::store_client;
use crate::uid::UidSource;

/// The three abstract syntaxes a printer proposes over an upstream leg,
/// on presentation ids `1, 3, 5` (§4.6.1, upstream paragraph).
const UPSTREAM_ABSTRACT_SYNTAXES: &[(u8, &str)] = &[
    (1, uids::BASIC_GRAYSCALE_PRINT_MANAGEMENT_META),
    (3, uids::PRESENTATION_LUT),
    (5, uids::VERIFICATION),
];

/// Abstract syntaxes this SCP negotiates on incoming associations: the
/// meta class plus every constituent SOP class a client may open a
/// presentation context against directly, Verification, and Presentation
/// LUT. Color print management and Print Job are not implemented.
const LOCAL_ABSTRACT_SYNTAXES: &[&str] = &[
    uids::VERIFICATION,
    uids::BASIC_GRAYSCALE_PRINT_MANAGEMENT_META,
    uids::BASIC_FILM_SESSION,
    uids::BASIC_FILM_BOX,
    uids::BASIC_GRAYSCALE_IMAGE_BOX,
    uids::PRINTER,
    uids::PRESENTATION_LUT,
];

/// Settings fixed for the lifetime of the supervisor, passed down to
/// every accepted association.
pub struct HandleOptions<'a> {
    pub max_pdu_length: u32,
    pub strict: bool,
    pub block_mode: bool,
    pub timeout: Duration,
    pub spool_path: &'a Utf8Path,
}

type Response = InMemDicomObject<StandardDataDictionary>;

/// Negotiate, then run one association to completion.
pub fn handle_association(
    socket: TcpStream,
    config: &ConfigView,
    uid_source: &dyn UidSource,
    options: &HandleOptions,
) -> Result<(), ScpError> {
    let transfer_syntaxes = association::preferred_transfer_syntaxes();
    let policy = AcceptPolicy {
        max_pdu_length: options.max_pdu_length,
        strict: options.strict,
        abstract_syntaxes: LOCAL_ABSTRACT_SYNTAXES,
        transfer_syntaxes: &transfer_syntaxes,
    };

    let assoc = association::accept(
        socket,
        &policy,
        |name| config.child_groups().contains(name),
        |uid| uid == private_sop_uids::SHUTDOWN_SOP_CLASS,
    )?;

    let printer = assoc.called_ae_title.clone();
    let pc = PrinterConfig::resolve(config, &printer, &assoc.calling_ae_title, options.max_pdu_length);

    tracing::info!(printer = %printer, calling_ae = %assoc.calling_ae_title, "association accepted");

    let mut session = PrintSession::new(
        printer.clone(),
        &pc.aetitle,
        options.block_mode,
        options.timeout,
        pc.force_unique_series,
        pc.force_unique_study,
    );

    if !pc.upstream_aetitle.is_empty() {
        match association::connect(
            &pc.upstream_address,
            pc.print_port,
            &pc.aetitle,
            &pc.upstream_aetitle,
            UPSTREAM_ABSTRACT_SYNTAXES,
            &transfer_syntaxes,
            pc.pdu_size,
        ) {
            Ok(upstream) => {
                return run_proxy(assoc, upstream, &mut session, config, uid_source, options, &pc);
            }
            Err(error) => {
                tracing::warn!(printer = %printer, %error, "failed to open upstream association, continuing in local mode");
            }
        }
    }

    run_local(assoc, &mut session, config, uid_source, options, &pc)
}

/// A printer identity's resolved configuration.
struct PrinterConfig {
    aetitle: String,
    upstream_aetitle: String,
    upstream_address: String,
    print_port: u16,
    pdu_size: u32,
    force_unique_series: bool,
    force_unique_study: bool,
    storage_servers: Vec<String>,
    strict_film_session_delete: bool,
}

impl PrinterConfig {
    fn resolve(config: &ConfigView, printer: &str, calling_ae: &str, default_pdu: u32) -> Self {
        let mut scoped = config.clone();
        scoped.begin_group(printer);
        let aetitle = scoped.get_string("aetitle", calling_ae);
        let upstream_aetitle = scoped.get_string("upstream-aetitle", "");
        let upstream_address = scoped.get_string("upstream-address", "");
        let print_port = scoped.get_i64("print-port", 0) as u16;
        let pdu_size = scoped.get_i64("pdu-size", default_pdu as i64) as u32;
        let force_unique_series = scoped.get_bool("force-unique-series", false);
        let force_unique_study = scoped.get_bool("force-unique-study", false);
        let strict_film_session_delete = scoped.get_bool("strict-film-session-delete", false);
        let storage_servers = scoped.get_string_list("storage-servers");
        Self {
            aetitle,
            upstream_aetitle,
            upstream_address,
            print_port,
            pdu_size,
            force_unique_series,
            force_unique_study,
            storage_servers,
            strict_film_session_delete,
        }
    }

    /// Looks up `alias` in the `<printer>.info[]` array (§4.6.3).
    fn printer_info(&self, config: &ConfigView, printer: &str, alias: &str) -> Option<String> {
        let mut scoped = config.clone();
        scoped.begin_group(printer);
        let entries = scoped.begin_read_array("info");
        entries.into_iter().find_map(|entry| {
            let table = entry.as_table()?;
            if table.get("key")?.as_str()? != alias {
                return None;
            }
            table.get("value")?.as_str().map(str::to_owned)
        })
    }
}

/// Local-mode receive loop: dispatch every command, terminate on
/// release, abort, or protocol error.
fn run_local(
    mut assoc: Association,
    session: &mut PrintSession,
    config: &ConfigView,
    uid_source: &dyn UidSource,
    options: &HandleOptions,
    pc: &PrinterConfig,
) -> Result<(), ScpError> {
    let mut ocr_engine = NullOcrEngine;
    let ocr_lang = config.get_string("ocr-lang", "eng");
    crate::ocr::with_c_numeric_locale(|| ocr_engine.init(&ocr_lang));

    loop {
        match assoc.receive_message()? {
            SessionEvent::Released => {
                assoc.release_as_acceptor()?;
                tracing::info!(printer = %session.printer, "association released");
                return Ok(());
            }
            SessionEvent::Message(msg) => {
                let request = DimseRequest::parse(&msg.command)?;
                let ts = assoc.transfer_syntax_for(msg.presentation_context_id)?;
                let rq_dataset = match &msg.dataset_bytes {
                    Some(bytes) => Some(InMemDicomObject::read_dataset_with_ts(bytes.as_slice(), ts)?),
                    None => None,
                };

                let (response, rsp_dataset, consumed_for_store) = dispatch(
                    &request,
                    &msg.command,
                    rq_dataset.as_ref(),
                    session,
                    config,
                    uid_source,
                    &mut ocr_engine,
                    options,
                    pc,
                );

                if !consumed_for_store {
                    if let Some(ds) = &rq_dataset {
                        session.merge_non_sequence(ds);
                    }
                    if let Some(ds) = &rsp_dataset {
                        session.merge_non_sequence(ds);
                    }
                }

                assoc.send_message(
                    msg.presentation_context_id,
                    &response,
                    rsp_dataset.as_ref().map(|d| (d, ts)),
                )?;
            }
        }
    }
}

/// Dispatch one command. Returns the response command set, an optional
/// response dataset, and whether the request dataset was consumed by the
/// image-box storage path (in which case the caller must not fold it
/// into `session_dataset`).
#[allow(clippy::too_many_arguments)]
fn dispatch(
    request: &DimseRequest,
    command: &InMemDicomObject,
    rq_dataset: Option<&InMemDicomObject>,
    session: &mut PrintSession,
    config: &ConfigView,
    uid_source: &dyn UidSource,
    ocr_engine: &mut dyn OcrEngine,
    options: &HandleOptions,
    pc: &PrinterConfig,
) -> (Response, Option<InMemDicomObject>, bool) {
    match request.command {
        CommandField::CEchoRq => (DimseResponseBuilder::for_request(request).build(), None, false),

        CommandField::NGetRq => handle_n_get(request, command, session, config, pc),

        CommandField::NSetRq => {
            let sop_class = request.requested_sop_class_uid.as_deref().unwrap_or("");
            if sop_class == uids::BASIC_GRAYSCALE_IMAGE_BOX {
                match rq_dataset {
                    Some(image_rq) => {
                        store_image(request, image_rq, session, config, uid_source, ocr_engine, options, pc);
                        (DimseResponseBuilder::for_request(request).build(), None, true)
                    }
                    None => (DimseResponseBuilder::for_request(request).build(), None, false),
                }
            } else {
                (DimseResponseBuilder::for_request(request).build(), None, false)
            }
        }

        CommandField::NActionRq => (DimseResponseBuilder::for_request(request).build(), None, false),

        CommandField::NCreateRq => handle_n_create(request, rq_dataset, session, uid_source),

        CommandField::NDeleteRq => handle_n_delete(request, session, pc),

        other => {
            tracing::warn!(command_field = other.to_u16(), "unsupported command field");
            (
                DimseResponseBuilder::for_request(request)
                    .status(status::PROCESSING_FAILURE)
                    .build(),
                None,
                false,
            )
        }
    }
}

/// Printer N-GET.
fn handle_n_get(
    request: &DimseRequest,
    command: &InMemDicomObject,
    session: &PrintSession,
    config: &ConfigView,
    pc: &PrinterConfig,
) -> (Response, Option<InMemDicomObject>, bool) {
    let sop_class = request
        .requested_sop_class_uid
        .as_deref()
        .or(request.affected_sop_class_uid.as_deref())
        .unwrap_or("");
    if sop_class != uids::PRINTER {
        return (
            DimseResponseBuilder::for_request(request).status(status::NO_SUCH_SOP_CLASS).build(),
            None,
            false,
        );
    }
    if request.target_sop_instance_uid() != Some(uids::PRINTER_INSTANCE) {
        return (
            DimseResponseBuilder::for_request(request)
                .status(status::NO_SUCH_OBJECT_INSTANCE)
                .build(),
            None,
            false,
        );
    }

    let identifiers: Vec<Tag> = command
        .element(tags::ATTRIBUTE_IDENTIFIER_LIST)
        .ok()
        .and_then(|e| e.tags().ok())
        .map(|tags| tags.to_vec())
        .unwrap_or_default();

    let mut response_dataset = InMemDicomObject::new_empty();
    if identifiers.is_empty() {
        put_default_printer_status(&mut response_dataset);
        return (
            DimseResponseBuilder::for_request(request).with_dataset().build(),
            Some(response_dataset),
            false,
        );
    }

    for tag in identifiers {
        if tag.1 == 0x0000 {
            continue; // group length
        }
        if tag == tags::PRINTER_STATUS || tag == tags::PRINTER_STATUS_INFO {
            put_default_printer_status(&mut response_dataset);
            continue;
        }
        let Some(entry) = StandardDataDictionary.by_tag(tag) else {
            return (
                DimseResponseBuilder::for_request(request)
                    .status(status::NO_SUCH_ATTRIBUTE)
                    .build(),
                None,
                false,
            );
        };
        let Some(value) = pc.printer_info(config, &session.printer, entry.alias) else {
            return (
                DimseResponseBuilder::for_request(request)
                    .status(status::NO_SUCH_ATTRIBUTE)
                    .build(),
                None,
                false,
            );
        };
        write_named_tag(&mut response_dataset, entry.alias, &value);
    }

    (
        DimseResponseBuilder::for_request(request).with_dataset().build(),
        Some(response_dataset),
        false,
    )
}

fn put_default_printer_status(dataset: &mut InMemDicomObject) {
    dataset.put(DataElement::new(tags::PRINTER_STATUS, VR::CS, PrimitiveValue::from("NORMAL")));
    dataset.put(DataElement::new(
        tags::PRINTER_STATUS_INFO,
        VR::CS,
        PrimitiveValue::from("NORMAL"),
    ));
}

/// N-CREATE per class.
fn handle_n_create(
    request: &DimseRequest,
    rq_dataset: Option<&InMemDicomObject>,
    session: &mut PrintSession,
    uid_source: &dyn UidSource,
) -> (Response, Option<InMemDicomObject>, bool) {
    let sop_class = request.affected_sop_class_uid.as_deref().unwrap_or("");
    match sop_class {
        uids::BASIC_FILM_SESSION => {
            if session.has_film_session() {
                return (
                    DimseResponseBuilder::for_request(request)
                        .status(status::DUPLICATE_SOP_INSTANCE)
                        .clear_affected_sop_instance_uid()
                        .build(),
                    None,
                    false,
                );
            }
            let uid = request.affected_sop_instance_uid.clone().unwrap_or_else(|| uid_source.new_uid());
            let _ = session.open_film_session(uid.clone());
            (
                DimseResponseBuilder::for_request(request).affected_sop_instance_uid(uid).build(),
                None,
                false,
            )
        }
        uids::BASIC_FILM_BOX => {
            let uid = request.affected_sop_instance_uid.clone().unwrap_or_else(|| uid_source.new_uid());
            session.open_film_box(uid.clone());
            let mut response_dataset = rq_dataset.cloned().unwrap_or_else(InMemDicomObject::new_empty);
            let count = film_box_item_count(rq_dataset);
            let items: Vec<InMemDicomObject> = (0..count)
                .map(|_| {
                    let mut item = InMemDicomObject::new_empty();
                    item.put(DataElement::new(
                        tags::REFERENCED_SOP_CLASS_UID,
                        VR::UI,
                        PrimitiveValue::from(uids::BASIC_GRAYSCALE_IMAGE_BOX.to_string()),
                    ));
                    item.put(DataElement::new(
                        tags::REFERENCED_SOP_INSTANCE_UID,
                        VR::UI,
                        PrimitiveValue::from(uid_source.new_uid()),
                    ));
                    item
                })
                .collect();
            response_dataset.put(DataElement::new(
                tags::REFERENCED_IMAGE_BOX_SEQUENCE,
                VR::SQ,
                DicomValue::new_sequence(items, Length::UNDEFINED),
            ));
            (
                DimseResponseBuilder::for_request(request)
                    .affected_sop_instance_uid(uid)
                    .with_dataset()
                    .build(),
                Some(response_dataset),
                false,
            )
        }
        uids::PRESENTATION_LUT => {
            let uid = request.affected_sop_instance_uid.clone().unwrap_or_else(|| uid_source.new_uid());
            let response_dataset = rq_dataset.cloned();
            let builder = DimseResponseBuilder::for_request(request).affected_sop_instance_uid(uid);
            let builder = if response_dataset.is_some() { builder.with_dataset() } else { builder };
            (builder.build(), response_dataset, false)
        }
        _ => (
            DimseResponseBuilder::for_request(request).status(status::NO_SUCH_SOP_CLASS).build(),
            None,
            false,
        ),
    }
}

/// N-DELETE per class.
fn handle_n_delete(
    request: &DimseRequest,
    session: &mut PrintSession,
    pc: &PrinterConfig,
) -> (Response, Option<InMemDicomObject>, bool) {
    let sop_class = request.requested_sop_class_uid.as_deref().unwrap_or("");
    match sop_class {
        uids::BASIC_FILM_SESSION => {
            if pc.strict_film_session_delete
                && request.target_sop_instance_uid() != session.study_uid.as_deref()
            {
                return (
                    DimseResponseBuilder::for_request(request)
                        .status(status::NO_SUCH_OBJECT_INSTANCE)
                        .build(),
                    None,
                    false,
                );
            }
            session.close_film_session();
            (DimseResponseBuilder::for_request(request).build(), None, false)
        }
        uids::BASIC_FILM_BOX | uids::PRESENTATION_LUT => {
            (DimseResponseBuilder::for_request(request).build(), None, false)
        }
        _ => (
            DimseResponseBuilder::for_request(request).status(status::NO_SUCH_SOP_CLASS).build(),
            None,
            false,
        ),
    }
}

/// Parses `ImageDisplayFormat` of the form `STANDARD\C,R`, returning
/// `C * R`, defaulting to 1 on anything unrecognized.
fn film_box_item_count(rq_dataset: Option<&InMemDicomObject>) -> u32 {
    let Some(format) = rq_dataset
        .and_then(|d| d.element(tags::IMAGE_DISPLAY_FORMAT).ok())
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches('\0').to_string())
    else {
        return 1;
    };
    let format = format.trim();
    let Some(rest) = format.strip_prefix("STANDARD\\") else {
        return 1;
    };
    let Some((a, b)) = rest.split_once(',') else {
        return 1;
    };
    let a: u32 = a.trim().parse().unwrap_or(0);
    let b: u32 = b.trim().parse().unwrap_or(0);
    (a * b).max(1)
}

/// Image-box storage path, triggered by N-SET(BasicGrayscaleImageBox).
#[allow(clippy::too_many_arguments)]
fn store_image(
    request: &DimseRequest,
    image_rq: &InMemDicomObject,
    session: &mut PrintSession,
    config: &ConfigView,
    uid_source: &dyn UidSource,
    ocr_engine: &mut dyn OcrEngine,
    options: &HandleOptions,
    pc: &PrinterConfig,
) {
    let sop_instance_uid = request
        .target_sop_instance_uid()
        .map(str::to_string)
        .unwrap_or_else(|| uid_source.new_uid());

    if pc.force_unique_study {
        session.study_uid = Some(uid_source.new_uid());
    }
    if pc.force_unique_series {
        session.series_uid = Some(uid_source.new_uid());
    }

    let mut image = image_rq.clone();
    if let Ok(elt) = image.element(tags::BASIC_GRAYSCALE_IMAGE_SEQUENCE) {
        let first_item_elements: Vec<_> = elt
            .value()
            .items()
            .and_then(|items| items.first())
            .map(|item| item.into_iter().cloned().collect())
            .unwrap_or_else(Vec::new);
        image.remove_element(tags::BASIC_GRAYSCALE_IMAGE_SEQUENCE);
        for element in first_item_elements {
            image.put(element);
        }
    }

    for element in &session.session_dataset {
        image.put(element.clone());
    }

    let (date, time_str) = now_date_time();
    image.put(DataElement::new(
        tags::SPECIFIC_CHARACTER_SET,
        VR::CS,
        PrimitiveValue::from("ISO_IR 192"),
    ));
    if let Some(study_uid) = &session.study_uid {
        image.put(DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, PrimitiveValue::from(study_uid.clone())));
    }
    if let Some(series_uid) = &session.series_uid {
        image.put(DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, PrimitiveValue::from(series_uid.clone())));
    }
    image.put(DataElement::new(
        tags::SOP_INSTANCE_UID,
        VR::UI,
        PrimitiveValue::from(sop_instance_uid.clone()),
    ));
    image.put(DataElement::new(tags::INSTANCE_CREATION_DATE, VR::DA, PrimitiveValue::from(date.clone())));
    image.put(DataElement::new(tags::INSTANCE_CREATION_TIME, VR::TM, PrimitiveValue::from(time_str.clone())));
    image.put(DataElement::new(tags::STUDY_DATE, VR::DA, PrimitiveValue::from(date)));
    image.put(DataElement::new(tags::STUDY_TIME, VR::TM, PrimitiveValue::from(time_str)));
    image.put(DataElement::new(
        tags::MANUFACTURER,
        VR::LO,
        PrimitiveValue::from("virtual-dicom-printer"),
    ));
    image.put(DataElement::new(
        tags::MANUFACTURER_MODEL_NAME,
        VR::LO,
        PrimitiveValue::from("virtual-dicom-printer"),
    ));
    image.put(DataElement::new(
        dicom_tags::RETIRED_DESTINATION_AE,
        VR::AE,
        PrimitiveValue::from(pc.aetitle.clone()),
    ));

    session.sop_instance_uid = Some(sop_instance_uid.clone());

    let sop_class_uid = image
        .element(tags::SOP_CLASS_UID)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches('\0').to_string())
        .unwrap_or_else(|| uids::BASIC_GRAYSCALE_IMAGE_BOX.to_string());

    let enriched = enrichment::query(config, &session.printer, &mut image, ocr_engine);
    if !enriched {
        image.put(DataElement::new(
            dicom_tags::RETIRED_PRINT_QUEUE_ID,
            VR::LO,
            PrimitiveValue::from(session.printer.clone()),
        ));
        if let Err(error) = spool::save(options.spool_path, &image) {
            tracing::error!(printer = %session.printer, %error, "failed to spool image after enrichment failure");
        }
        return;
    }

    for server in &pc.storage_servers {
        if let Err(error) = store_client::send_to_server(config, server, &image, &sop_class_uid, &sop_instance_uid) {
            tracing::warn!(printer = %session.printer, server = %server, %error, "store to server failed, spooling");
            let server_dir = options.spool_path.join(server);
            if let Err(error) = spool::save(&server_dir, &image) {
                tracing::error!(printer = %session.printer, server = %server, %error, "failed to spool image after store failure");
            }
        }
    }
}

fn now_date_time() -> (String, String) {
    let now = OffsetDateTime::now_utc();
    let date = format!("{:04}{:02}{:02}", now.year(), u8::from(now.month()), now.day());
    let time_str = format!("{:02}{:02}{:02}", now.hour(), now.minute(), now.second());
    (date, time_str)
}

/// Upstream proxy path: forward every command/dataset verbatim in both
/// directions, while still running the side effects of N-CREATE's UID
/// bookkeeping and image-box storage against the upstream's actual
/// responses.
#[allow(clippy::too_many_arguments)]
fn run_proxy(
    mut down: Association,
    mut up: Association,
    session: &mut PrintSession,
    config: &ConfigView,
    uid_source: &dyn UidSource,
    options: &HandleOptions,
    pc: &PrinterConfig,
) -> Result<(), ScpError> {
    let mut ocr_engine = NullOcrEngine;
    let ocr_lang = config.get_string("ocr-lang", "eng");
    crate::ocr::with_c_numeric_locale(|| ocr_engine.init(&ocr_lang));

    loop {
        match down.receive_message()? {
            SessionEvent::Released => {
                down.release_as_acceptor()?;
                let _ = up.release_as_requestor();
                tracing::info!(printer = %session.printer, "proxied association released");
                return Ok(());
            }
            SessionEvent::Message(msg) => {
                let request = DimseRequest::parse(&msg.command)?;

                up.send_raw(msg.presentation_context_id, &msg.command_bytes, msg.dataset_bytes.as_deref())?;

                let SessionEvent::Message(up_msg) = up.receive_message()? else {
                    return Err(ScpError::CannotRespond("upstream released before responding"));
                };

                down.send_raw(
                    msg.presentation_context_id,
                    &up_msg.command_bytes,
                    up_msg.dataset_bytes.as_deref(),
                )?;

                let rsp_status = up_msg.command.element(tags::STATUS).ok().and_then(|e| e.uint16().ok());
                let rsp_sop_instance_uid = up_msg
                    .command
                    .element(tags::AFFECTED_SOP_INSTANCE_UID)
                    .ok()
                    .and_then(|e| e.to_str().ok())
                    .map(|s| s.to_string());

                if request.command == CommandField::NCreateRq && rsp_status == Some(status::SUCCESS) {
                    match request.affected_sop_class_uid.as_deref() {
                        Some(uids::BASIC_FILM_SESSION) => session.study_uid = rsp_sop_instance_uid.clone(),
                        Some(uids::BASIC_FILM_BOX) => session.series_uid = rsp_sop_instance_uid.clone(),
                        _ => {}
                    }
                }

                let is_image_box_set = request.command == CommandField::NSetRq
                    && request.requested_sop_class_uid.as_deref() == Some(uids::BASIC_GRAYSCALE_IMAGE_BOX);

                let ts = down.transfer_syntax_for(msg.presentation_context_id)?;
                if is_image_box_set {
                    if let Some(bytes) = &msg.dataset_bytes {
                        let image_rq = InMemDicomObject::read_dataset_with_ts(bytes.as_slice(), ts)?;
                        store_image(&request, &image_rq, session, config, uid_source, &mut ocr_engine, options, pc);
                    }
                } else {
                    if let Some(bytes) = &msg.dataset_bytes {
                        let ds = InMemDicomObject::read_dataset_with_ts(bytes.as_slice(), ts)?;
                        session.merge_non_sequence(&ds);
                    }
                    if let Some(bytes) = &up_msg.dataset_bytes {
                        let ds = InMemDicomObject::read_dataset_with_ts(bytes.as_slice(), ts)?;
                        session.merge_non_sequence(&ds);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use dicom::core::{DataElement, PrimitiveValue, VR};

    use super::*;
    use crate::uid::SiteUidSource;

    fn request(command: CommandField) -> DimseRequest {
        DimseRequest {
            command,
            message_id: 1,
            affected_sop_class_uid: None,
            affected_sop_instance_uid: None,
            requested_sop_class_uid: None,
            requested_sop_instance_uid: None,
            action_type_id: None,
            has_dataset: false,
        }
    }

    fn printer_config() -> PrinterConfig {
        PrinterConfig {
            aetitle: "VIRTUALPRINTER".to_string(),
            upstream_aetitle: String::new(),
            upstream_address: String::new(),
            print_port: 0,
            pdu_size: 16384,
            force_unique_series: false,
            force_unique_study: false,
            storage_servers: Vec::new(),
            strict_film_session_delete: false,
        }
    }

    #[test]
    fn film_box_item_count_parses_rows_and_columns() {
        let mut ds = InMemDicomObject::new_empty();
        ds.put(DataElement::new(
            tags::IMAGE_DISPLAY_FORMAT,
            VR::ST,
            PrimitiveValue::from("STANDARD\\2,3"),
        ));
        assert_eq!(film_box_item_count(Some(&ds)), 6);
    }

    #[test]
    fn film_box_item_count_defaults_to_one_when_absent_or_malformed() {
        assert_eq!(film_box_item_count(None), 1);

        let mut ds = InMemDicomObject::new_empty();
        ds.put(DataElement::new(tags::IMAGE_DISPLAY_FORMAT, VR::ST, PrimitiveValue::from("ROW\\1")));
        assert_eq!(film_box_item_count(Some(&ds)), 1);
    }

    #[test]
    fn n_create_film_session_rejects_duplicate() {
        let mut request = request(CommandField::NCreateRq);
        request.affected_sop_class_uid = Some(uids::BASIC_FILM_SESSION.to_string());
        let uid_source = SiteUidSource::new("1.2.826.0.1.3680043.8.498");
        let mut session = PrintSession::new("P1", "P1", true, Duration::from_secs(30), false, false);

        let (first, _, _) = handle_n_create(&request, None, &mut session, &uid_source);
        assert_eq!(first.element(tags::STATUS).unwrap().uint16().unwrap(), status::SUCCESS);
        assert!(session.has_film_session());

        let (second, _, _) = handle_n_create(&request, None, &mut session, &uid_source);
        assert_eq!(
            second.element(tags::STATUS).unwrap().uint16().unwrap(),
            status::DUPLICATE_SOP_INSTANCE
        );
        assert!(second.element(tags::AFFECTED_SOP_INSTANCE_UID).is_err());
    }

    #[test]
    fn n_create_film_box_builds_requested_image_box_count() {
        let mut request = request(CommandField::NCreateRq);
        request.affected_sop_class_uid = Some(uids::BASIC_FILM_BOX.to_string());
        let uid_source = SiteUidSource::new("1.2.826.0.1.3680043.8.498");
        let mut session = PrintSession::new("P1", "P1", true, Duration::from_secs(30), false, false);

        let mut rq_dataset = InMemDicomObject::new_empty();
        rq_dataset.put(DataElement::new(
            tags::IMAGE_DISPLAY_FORMAT,
            VR::ST,
            PrimitiveValue::from("STANDARD\\1,2"),
        ));

        let (rsp, rsp_dataset, consumed) = handle_n_create(&request, Some(&rq_dataset), &mut session, &uid_source);
        assert_eq!(rsp.element(tags::STATUS).unwrap().uint16().unwrap(), status::SUCCESS);
        assert!(!consumed);
        let dataset = rsp_dataset.expect("film box response carries a dataset");
        let items = dataset
            .element(tags::REFERENCED_IMAGE_BOX_SEQUENCE)
            .unwrap()
            .value()
            .items()
            .unwrap()
            .len();
        assert_eq!(items, 2);
    }

    #[test]
    fn n_delete_film_session_strict_mode_rejects_mismatched_instance() {
        let mut request = request(CommandField::NDeleteRq);
        request.requested_sop_class_uid = Some(uids::BASIC_FILM_SESSION.to_string());
        request.requested_sop_instance_uid = Some("1.2.999".to_string());
        let mut session = PrintSession::new("P1", "P1", true, Duration::from_secs(30), false, false);
        session.study_uid = Some("1.2.3".to_string());
        let mut pc = printer_config();
        pc.strict_film_session_delete = true;

        let (rsp, _, _) = handle_n_delete(&request, &mut session, &pc);
        assert_eq!(
            rsp.element(tags::STATUS).unwrap().uint16().unwrap(),
            status::NO_SUCH_OBJECT_INSTANCE
        );
        assert!(session.has_film_session());
    }

    #[test]
    fn n_delete_film_session_non_strict_mode_always_clears() {
        let mut request = request(CommandField::NDeleteRq);
        request.requested_sop_class_uid = Some(uids::BASIC_FILM_SESSION.to_string());
        request.requested_sop_instance_uid = Some("1.2.999".to_string());
        let mut session = PrintSession::new("P1", "P1", true, Duration::from_secs(30), false, false);
        session.study_uid = Some("1.2.3".to_string());
        let pc = printer_config();

        let (rsp, _, _) = handle_n_delete(&request, &mut session, &pc);
        assert_eq!(rsp.element(tags::STATUS).unwrap().uint16().unwrap(), status::SUCCESS);
        assert!(!session.has_film_session());
    }

    #[test]
    fn n_get_printer_unknown_sop_class_is_rejected() {
        let mut request = request(CommandField::NGetRq);
        request.requested_sop_class_uid = Some(uids::BASIC_FILM_BOX.to_string());
        let command = InMemDicomObject::new_empty();
        let session = PrintSession::new("P1", "P1", true, Duration::from_secs(30), false, false);
        let config = ConfigView::load("/nonexistent/vdicomprint-test.toml").unwrap();
        let pc = printer_config();

        let (rsp, dataset, _) = handle_n_get(&request, &command, &session, &config, &pc);
        assert_eq!(rsp.element(tags::STATUS).unwrap().uint16().unwrap(), status::NO_SUCH_SOP_CLASS);
        assert!(dataset.is_none());
    }

    #[test]
    fn n_get_printer_with_no_identifier_list_returns_default_status() {
        let mut request = request(CommandField::NGetRq);
        request.requested_sop_class_uid = Some(uids::PRINTER.to_string());
        request.requested_sop_instance_uid = Some(uids::PRINTER_INSTANCE.to_string());
        let command = InMemDicomObject::new_empty();
        let session = PrintSession::new("P1", "P1", true, Duration::from_secs(30), false, false);
        let config = ConfigView::load("/nonexistent/vdicomprint-test.toml").unwrap();
        let pc = printer_config();

        let (rsp, dataset, _) = handle_n_get(&request, &command, &session, &config, &pc);
        assert_eq!(rsp.element(tags::STATUS).unwrap().uint16().unwrap(), status::SUCCESS);
        let dataset = dataset.expect("default status dataset");
        assert_eq!(
            dataset.element(tags::PRINTER_STATUS).unwrap().to_str().unwrap(),
            "NORMAL"
        );
    }

    #[test]
    fn printer_config_resolve_reads_storage_servers_from_printer_scope() {
        let mut config = ConfigView::load("/nonexistent/vdicomprint-test.toml").unwrap();
        config.begin_group("P1");
        config.set(
            "storage-servers",
            toml::Value::Array(vec![toml::Value::String("pacs1".to_string())]),
        );
        config.end_group();

        let pc = PrinterConfig::resolve(&config, "P1", "CALLER", 16384);
        assert_eq!(pc.storage_servers, vec!["pacs1".to_string()]);
    }
}
