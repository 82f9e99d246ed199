pub mod codec;
pub mod messages;
pub mod transport;

/// Maximum allowed DAP message payload size (in bytes).
///
/// This caps the value of the incoming `Content-Length` header so a malformed
/// client cannot make the adapter buffer an arbitrarily large body. Larger
/// frames are skipped without being buffered.
pub const MAX_DAP_MESSAGE_BYTES: usize = 16 * 1024 * 1024; // 16 MiB

/// Maximum size of a header block, including the blank separator line.
pub const MAX_DAP_HEADER_BYTES: usize = 8 * 1024; // 8 KiB
