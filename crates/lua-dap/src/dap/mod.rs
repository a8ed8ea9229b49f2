pub mod codec;
pub mod messages;
pub mod types;

/// Maximum allowed DAP message payload size (in bytes).
///
/// Caps both the `Content-Length` header of the TCP framing and the 4-byte length prefix of the
/// pipe framing, so a hostile peer cannot make the adapter allocate an arbitrary buffer before the
/// body is even read.
pub const MAX_DAP_MESSAGE_BYTES: usize = 16 * 1024 * 1024; // 16 MiB

/// Maximum allowed size of a single DAP header line (in bytes).
pub const MAX_DAP_HEADER_LINE_BYTES: usize = 8 * 1024; // 8 KiB
