//! A virtual DICOM print SCP: accepts Basic Grayscale Print Management
//! associations, spools and optionally forwards received film as
//! Secondary Capture instances, and proxies a session to a real printer
//! when a printer group is configured with an upstream address.

mod association;
mod config;
mod dicom_tags;
mod dimse;
mod enrichment;
mod error;
mod ocr;
mod private_sop_uids;
mod retry;
mod sanitize;
mod scp;
mod scp_error;
mod session;
mod settings;
mod spool;
mod store_client;
mod supervisor;
mod transliteration;
mod uid;

pub use config::ConfigView;
pub use error::{ConfigError, StartupError};
pub use scp_error::ScpError;
pub use settings::Settings;
pub use supervisor::run;
