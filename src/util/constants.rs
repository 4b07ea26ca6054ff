/// log2 of the number of bits in a byte
pub const LOG_BITS_IN_BYTE: u8 = 3;
/// The number of bits in a byte
pub const BITS_IN_BYTE: usize = 1 << LOG_BITS_IN_BYTE;

#[cfg(target_pointer_width = "32")]
/// log2 of the number of bytes in a machine word
pub const LOG_BYTES_IN_WORD: u8 = 2;
#[cfg(target_pointer_width = "64")]
/// log2 of the number of bytes in a machine word
pub const LOG_BYTES_IN_WORD: u8 = 3;
/// The number of bytes in a machine word
pub const BYTES_IN_WORD: usize = 1 << LOG_BYTES_IN_WORD;
/// log2 of the number of bits in a machine word
pub const LOG_BITS_IN_WORD: u8 = LOG_BITS_IN_BYTE + LOG_BYTES_IN_WORD;
/// The number of bits in a machine word
pub const BITS_IN_WORD: usize = 1 << LOG_BITS_IN_WORD;

/// log2 of the number of bytes in a kilobyte
pub const LOG_BYTES_IN_KBYTE: u8 = 10;
/// The number of bytes in a kilobyte
pub const BYTES_IN_KBYTE: usize = 1 << LOG_BYTES_IN_KBYTE;

/// log2 of the number of bytes in a megabyte
pub const LOG_BYTES_IN_MBYTE: u8 = 20;
/// The number of bytes in a megabyte
pub const BYTES_IN_MBYTE: usize = 1 << LOG_BYTES_IN_MBYTE;

/// log2 of the number of bytes covered by a single card table entry
pub const LOG_BYTES_IN_CARD: u8 = 9;
/// The number of heap bytes covered by a single card table entry
pub const BYTES_IN_CARD: usize = 1 << LOG_BYTES_IN_CARD;
/// Mask selecting the offset of an address within its card
pub const CARD_MASK: usize = BYTES_IN_CARD - 1;

/// Smallest supported region size
pub const MIN_REGION_SIZE: usize = BYTES_IN_MBYTE;
/// Largest supported region size
pub const MAX_REGION_SIZE: usize = 32 * BYTES_IN_MBYTE;
/// When the region size is not forced, aim for this many regions.
pub const TARGET_REGION_NUMBER: usize = 2048;
