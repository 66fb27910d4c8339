//! Drives the running Print SCP over a loopback TCP connection with a
//! real DICOM upper-layer client, the way the teacher's own
//! `tests/integration_test.rs` runs `run_everything` end to end instead
//! of unit-testing its pieces in isolation. Scenarios that need a real
//! upstream printer (the proxy path, C7) are out of scope here and are
//! covered only by the unit tests in `src/scp.rs`; this test exercises
//! the association-accept and C-ECHO verification path (§4.3) against
//! our own listener, which needs no external service to be running.

use std::io::Write;
use std::num::NonZeroUsize;
use std::time::Duration;

use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::{tags, uids};
use dicom::object::InMemDicomObject;
use dicom::ul::association::ClientAssociationOptions;
use dicom::ul::pdu::{PDataValue, PDataValueType};
use dicom::ul::Pdu;

const TEST_PORT: u16 = 17112;
const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";

#[tokio::test(flavor = "multi_thread")]
async fn c_echo_against_the_running_scp_returns_success() {
    let spool_dir = tempfile::tempdir().unwrap();
    let mut config_file = tempfile::NamedTempFile::new().unwrap();
    writeln!(config_file, "[TESTPRINTER]").unwrap();
    writeln!(config_file, "aetitle = \"TESTPRINTER\"").unwrap();
    let config_path =
        camino::Utf8PathBuf::from_path_buf(config_file.path().to_path_buf()).unwrap();

    let settings = vdicomprint::Settings {
        config_path: config_path.clone(),
        port: TEST_PORT,
        aetitle: "TESTPRINTER".to_string(),
        max_associations: NonZeroUsize::new(4).unwrap(),
        timeout: Duration::from_secs(5),
        spool_path: camino::Utf8PathBuf::from_path_buf(spool_dir.path().to_path_buf()).unwrap(),
        spool_interval: Duration::from_secs(600),
        log_level: "error".to_string(),
        storage_servers: Vec::new(),
    };
    let config = vdicomprint::ConfigView::load(&config_path).unwrap();

    let server = tokio::spawn(vdicomprint::run(settings, config));
    // give the accept loop time to bind before the client dials in
    tokio::time::sleep(Duration::from_millis(200)).await;

    let status = tokio::task::spawn_blocking(send_c_echo).await.unwrap();
    pretty_assertions::assert_eq!(status, 0x0000u16);

    server.abort();
}

/// Opens its own association and sends one C-ECHO-RQ, independent of any
/// of this crate's own client plumbing (`src/store_client.rs` is an SCU
/// to a *storage* peer, not a verification client).
fn send_c_echo() -> u16 {
    let mut association = ClientAssociationOptions::new()
        .calling_ae_title("TESTSCU")
        .called_ae_title("TESTPRINTER")
        .with_abstract_syntax(uids::VERIFICATION)
        .with_transfer_syntax(IMPLICIT_VR_LITTLE_ENDIAN)
        .establish(("127.0.0.1", TEST_PORT))
        .expect("association with the test SCP should be accepted");

    let command = InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            PrimitiveValue::from(0x0030u16), // C-ECHO-RQ
        ),
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(uids::VERIFICATION.to_string()),
        ),
        DataElement::new(tags::MESSAGE_ID, VR::US, PrimitiveValue::from(1u16)),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            PrimitiveValue::from(0x0101u16), // no data set
        ),
    ]);
    let mut command_bytes = Vec::new();
    let implicit_vr = dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    command
        .write_dataset_with_ts(&mut command_bytes, &implicit_vr)
        .unwrap();

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
        .unwrap();

    let rsp = association.receive().unwrap();
    let Pdu::PData { data } = rsp else {
        panic!("expected a PData PDU carrying the C-ECHO-RSP command set");
    };
    let obj = InMemDicomObject::read_dataset_with_ts(data[0].data.as_slice(), &implicit_vr)
        .expect("C-ECHO-RSP command set should parse");
    let status = obj
        .element(tags::STATUS)
        .expect("C-ECHO-RSP should carry a Status element")
        .uint16()
        .unwrap();

    let _ = association.release();
    status
}
