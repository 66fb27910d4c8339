//! Private SOP class UIDs.

/// Private "shutdown" abstract syntax: an SCU that proposes this
/// presentation context during negotiation is asking the running server to
/// terminate after this association is rejected, rather than asking for a
/// normal print service. Not part of any registered SOP class; declared
/// under this service's own private root since no public UID exists for it.
pub const SHUTDOWN_SOP_CLASS: &str = "1.2.826.0.1.3680043.8.498.1.9.1";
