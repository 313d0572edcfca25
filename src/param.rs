/// Bytes per disk sector, the quantum of all disk I/O.
pub const SECTOR_SIZE: usize = 128;

/// Sectors on the simulated disk.
pub const NUM_SECTORS: usize = 1024;

/// Direct sector slots in a file header. Chosen so the header
/// (four fixed words plus the direct table) fills one sector exactly.
pub const NUM_DIRECT: usize = (SECTOR_SIZE - 4 * 4) / 4;

/// Sector slots in an indirect block (one count word, then entries).
pub const NUM_INDIRECT: usize = (SECTOR_SIZE - 4) / 4;

/// Upper bound on file size, in sectors.
pub const MAX_FILE_SECTORS: usize = NUM_DIRECT + NUM_INDIRECT + NUM_INDIRECT * NUM_INDIRECT;

/// Bytes per page of user memory. Tied to the sector size so a page
/// is loaded from an executable one sector at a time.
pub const PAGE_SIZE: usize = SECTOR_SIZE;

/// Pages of simulated physical memory.
pub const NUM_PHYS_PAGES: usize = 128;

/// Pages added to an address space for each user thread's stack.
pub const STACK_PAGES: usize = 8;

/// Open files per process.
pub const MAX_OPEN_FILES: usize = 16;

/// First file id handed to user code; 0 and 1 name the console.
pub const FID_OFFSET: u32 = 2;

/// Reserved file id for console input.
pub const CONSOLE_INPUT: u32 = 0;

/// Reserved file id for console output.
pub const CONSOLE_OUTPUT: u32 = 1;

/// Maximum file name length that fits in a directory slot.
pub const MAX_FILE_NAME: usize = 9;

/// Directory slots in the (flat) file system.
pub const NUM_DIR_ENTRIES: usize = 64;

/// Longest NUL-terminated string fetched from user memory.
pub const MAX_USER_STR: usize = 128;
