/// log2 of the number of bits in a byte
pub const LOG_BITS_IN_BYTE: u8 = 3;
/// The number of bits in a byte
pub const BITS_IN_BYTE: usize = 1 << LOG_BITS_IN_BYTE;

/// log2 of the number of bytes in a megabyte
pub const LOG_BYTES_IN_MBYTE: u8 = 20;
/// The number of bytes in a megabyte
pub const BYTES_IN_MBYTE: usize = 1 << LOG_BYTES_IN_MBYTE;

/// log2 of the number of bytes in a kilobyte
pub const LOG_BYTES_IN_KBYTE: u8 = 10;
/// The number of bytes in a kilobyte
pub const BYTES_IN_KBYTE: usize = 1 << LOG_BYTES_IN_KBYTE;

/// log2 of the number of bytes in a word. The heap only supports 64-bit targets.
pub const LOG_BYTES_IN_WORD: u8 = 3;
/// The number of bytes in a word
pub const BYTES_IN_WORD: usize = 1 << LOG_BYTES_IN_WORD;
/// log2 of the number of bits in a word
pub const LOG_BITS_IN_WORD: usize = LOG_BITS_IN_BYTE as usize + LOG_BYTES_IN_WORD as usize;
/// The number of bits in a word
pub const BITS_IN_WORD: usize = 1 << LOG_BITS_IN_WORD;

/// log2 of the number of bytes in a page
pub const LOG_BYTES_IN_PAGE: u8 = 12;
/// The number of bytes in a page
pub const BYTES_IN_PAGE: usize = 1 << LOG_BYTES_IN_PAGE;

/// log2 of the object alignment. This is also the granule covered by one mark bit.
pub const LOG_MIN_OBJECT_ALIGNMENT: u8 = 4;
/// Every object starts at a multiple of this many bytes.
pub const MIN_OBJECT_ALIGNMENT: usize = 1 << LOG_MIN_OBJECT_ALIGNMENT;
/// The number of words in one alignment granule.
pub const WORDS_IN_GRANULE: usize = MIN_OBJECT_ALIGNMENT / BYTES_IN_WORD;

/// The smallest object is just the forwarding word and the header word.
pub const MIN_OBJECT_SIZE: usize = MIN_OBJECT_ALIGNMENT;

/// A full SATB buffer is handed off only if more than this percentage of it survives filtering.
pub const SATB_ENQUEUEING_THRESHOLD_PERCENT: usize = 60;

static_assertions::const_assert!(cfg!(target_pointer_width = "64"));
static_assertions::const_assert_eq!(MIN_OBJECT_SIZE % BYTES_IN_WORD, 0);
