//! Card presence, mounting and file reading
//!
//! The mount loop is the thread of control for the whole storage subsystem:
//! it polls the card-detect line, walks a newly inserted card through
//! identification, hands the block device to the filesystem collaborator and
//! re-initializes the controller after removals or failed attempts. While no
//! card is present it emits a rate-limited diagnostic and never returns.

use crate::card::SdCard;
use crate::edma::{edma3_completion_isr, edma3_error_isr, Edma3};
use crate::hal::intc::{self, Aintc};
use crate::hal::timer::SystemTimer;
use crate::hal::{EDMA_COMPLETION_INT, EDMA_ERROR_INT, MMCSD0_INT};
use crate::mmcsd::{mmchs_isr, ControllerOps, MmcsdDriver, XFER_FLAGS};
use defmt::Format;

/// Drive number handed to the filesystem collaborator
pub const MOUNT_DRIVE: u32 = 0;

/// Scratch chunk size for `read_file`
const READ_CHUNK: usize = 512;

/// Every how many absent-polls the "insert card" diagnostic repeats
const ABSENT_LOG_PERIOD: u32 = 20;

/// Opaque result code from the filesystem collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Format)]
pub struct FsError(pub i32);

/// The filesystem layer this driver mounts into. The collaborator owns all
/// format knowledge; this stack only moves blocks.
pub trait FileSystem {
    /// Open-file handle type
    type Handle;

    /// Mount `drive` on top of an identified card
    fn mount(&mut self, drive: u32, card: &SdCard) -> Result<(), FsError>;

    /// Open a file by path
    fn open(&mut self, path: &str) -> Result<Self::Handle, FsError>;

    /// Read up to `buf.len()` bytes; returns the byte count, 0 at end of file
    fn read(&mut self, handle: &mut Self::Handle, buf: &mut [u8]) -> Result<usize, FsError>;

    /// Close an open file
    fn close(&mut self, handle: Self::Handle) -> Result<(), FsError>;
}

/// Mount-loop bookkeeping, alive for the process lifetime
pub struct MountState {
    /// Whether the next insertion needs a fresh mount
    needs_mount: bool,
    /// Absent-poll counter driving the diagnostic throttle
    poll_count: u32,
}

impl MountState {
    /// Fresh state: the first insertion mounts
    pub const fn new() -> Self {
        Self {
            needs_mount: true,
            poll_count: 0,
        }
    }

    /// Account one card-absent poll; returns whether this iteration should
    /// emit the "please insert" diagnostic (iterations 1, 21, 41, ...)
    pub fn note_absent(&mut self) -> bool {
        self.poll_count = (self.poll_count + 1) & 0xFFF;
        self.poll_count % ABSENT_LOG_PERIOD == 1
    }
}

impl Default for MountState {
    fn default() -> Self {
        Self::new()
    }
}

/// Register and unmask the three storage ISRs, then open the CPU IRQ gate
fn interrupt_setup(aintc: &Aintc) {
    aintc.register_handler(EDMA_COMPLETION_INT, edma3_completion_isr);
    aintc.enable_vector(EDMA_COMPLETION_INT);

    aintc.register_handler(EDMA_ERROR_INT, edma3_error_isr);
    aintc.enable_vector(EDMA_ERROR_INT);

    aintc.register_handler(MMCSD0_INT, mmchs_isr);
    aintc.enable_vector(MMCSD0_INT);

    intc::master_irq_enable();
}

/// Identify the card and mount the filesystem on top of it
fn try_mount<F: FileSystem>(
    driver: &mut MmcsdDriver,
    fs: &mut F,
    timer: &SystemTimer,
) -> bool {
    let card = match SdCard::init(driver, timer) {
        Ok(card) => card,
        Err(e) => {
            defmt::error!("FS: card identification failed: {}", e);
            return false;
        }
    };

    match fs.mount(MOUNT_DRIVE, &card) {
        Ok(()) => {
            defmt::info!("FS: volume mounted");
            true
        }
        Err(e) => {
            defmt::error!("FS: mount failed: {}", e);
            false
        }
    }
}

/// Bring up the DMA engine, interrupts and controller, then run the mount
/// loop until media is mounted. Returns `true` with the mount established;
/// while no card is present this does not return. Re-mount handling after a
/// removal is performed by invoking this again.
pub fn start_file_system<F: FileSystem>(driver: &mut MmcsdDriver, fs: &mut F) -> bool {
    let timer = SystemTimer::new();
    timer.start();

    Edma3::new().init();
    interrupt_setup(&Aintc::new());

    if driver.bind_dma().is_err() {
        defmt::error!("FS: DMA channel binding failed");
        return false;
    }

    if let Err(e) = driver.init() {
        // The loop below re-runs initialization before mounting
        defmt::error!("FS: controller bring-up failed: {}", e);
    }
    driver.enable_interrupts();

    let mut state = MountState::new();
    loop {
        if driver.card_present() {
            if !state.needs_mount {
                return true;
            }
            if try_mount(driver, fs, &timer) {
                state.needs_mount = false;
                return true;
            }
            // Failed attempt: re-run controller initialization with clean
            // flags before trying again
            XFER_FLAGS.reset();
            if let Err(e) = driver.init() {
                defmt::error!("FS: re-initialization failed: {}", e);
            }
            driver.enable_interrupts();
            timer.delay_ms(1);
        } else {
            timer.delay_ms(1);

            if state.note_absent() {
                defmt::info!("FS: please insert the card");
            }

            if !state.needs_mount {
                // The card went away after a mount; queue a clean restart
                // for the next insertion
                XFER_FLAGS.reset();
                if let Err(e) = driver.init() {
                    defmt::error!("FS: re-initialization failed: {}", e);
                }
                driver.enable_interrupts();
                state.needs_mount = true;
            }
        }
    }
}

/// Read `size` bytes of `path` into `buf` through the filesystem
/// collaborator, in fixed-size chunks via a scratch buffer. Failures are
/// logged at the point of detection and abort the read; the collaborator's
/// opaque code is not propagated. Returns whether the read ran to
/// completion.
pub fn read_file<F: FileSystem>(
    fs: &mut F,
    buf: &mut [u8],
    size: usize,
    path: &str,
) -> bool {
    let mut handle = match fs.open(path) {
        Ok(handle) => handle,
        Err(e) => {
            defmt::error!("FS: file could not be opened: {}", e);
            return false;
        }
    };

    let goal = size.min(buf.len());
    let mut scratch = [0u8; READ_CHUNK];
    let mut total = 0;

    while total < goal {
        let want = READ_CHUNK.min(goal - total);
        let got = match fs.read(&mut handle, &mut scratch[..want]) {
            Ok(got) => got,
            Err(e) => {
                defmt::error!("FS: file could not be read: {}", e);
                return false;
            }
        };
        if got == 0 {
            break;
        }
        buf[total..total + got].copy_from_slice(&scratch[..got]);
        total += got;
    }

    if let Err(e) = fs.close(handle) {
        defmt::error!("FS: file could not be closed: {}", e);
        return false;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::string::String;
    use std::vec::Vec;

    #[test]
    fn absent_diagnostic_fires_every_twentieth_poll_starting_at_one() {
        let mut state = MountState::new();
        let mut fired = Vec::new();
        for iteration in 1..=100u32 {
            if state.note_absent() {
                fired.push(iteration);
            }
        }
        assert_eq!(fired, [1, 21, 41, 61, 81]);
    }

    #[test]
    fn absent_counter_wraps_without_losing_the_cadence() {
        let mut state = MountState::new();
        let mut wrapped_quiet = false;
        for _ in 0..0x1000 {
            wrapped_quiet = state.note_absent();
        }
        // Call 0x1000 lands the counter back on zero, which stays quiet
        assert!(!wrapped_quiet);
        // The next poll is "iteration 1" again and speaks
        assert!(state.note_absent());
    }

    /// In-memory stand-in for the filesystem collaborator
    struct MockFs {
        files: HashMap<String, Vec<u8>>,
        fail_read_after: Option<usize>,
        close_error: bool,
    }

    struct MockHandle {
        data: Vec<u8>,
        pos: usize,
        reads: usize,
    }

    impl MockFs {
        fn with_file(path: &str, data: Vec<u8>) -> Self {
            let mut files = HashMap::new();
            files.insert(path.to_string(), data);
            Self {
                files,
                fail_read_after: None,
                close_error: false,
            }
        }
    }

    impl FileSystem for MockFs {
        type Handle = MockHandle;

        fn mount(&mut self, _drive: u32, _card: &SdCard) -> Result<(), FsError> {
            Ok(())
        }

        fn open(&mut self, path: &str) -> Result<MockHandle, FsError> {
            self.files
                .get(path)
                .map(|data| MockHandle {
                    data: data.clone(),
                    pos: 0,
                    reads: 0,
                })
                .ok_or(FsError(-4))
        }

        fn read(&mut self, handle: &mut MockHandle, buf: &mut [u8]) -> Result<usize, FsError> {
            if let Some(limit) = self.fail_read_after {
                if handle.reads >= limit {
                    return Err(FsError(-5));
                }
            }
            handle.reads += 1;
            let remaining = handle.data.len() - handle.pos;
            let got = buf.len().min(remaining);
            buf[..got].copy_from_slice(&handle.data[handle.pos..handle.pos + got]);
            handle.pos += got;
            Ok(got)
        }

        fn close(&mut self, _handle: MockHandle) -> Result<(), FsError> {
            if self.close_error {
                Err(FsError(-6))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn read_file_fills_the_buffer_across_chunks() {
        let data: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        let mut fs = MockFs::with_file("boot/kernel.elf", data.clone());

        let mut buf = vec![0u8; 10_000];
        assert!(read_file(&mut fs, &mut buf, 10_000, "boot/kernel.elf"));
        assert_eq!(buf, data);
    }

    #[test]
    fn read_file_stops_at_end_of_short_file() {
        let data: Vec<u8> = vec![0xAB; 700];
        let mut fs = MockFs::with_file("short.bin", data.clone());

        let mut buf = vec![0u8; 4096];
        assert!(read_file(&mut fs, &mut buf, 4096, "short.bin"));
        assert_eq!(&buf[..700], &data[..]);
        assert!(buf[700..].iter().all(|&b| b == 0));
    }

    #[test]
    fn read_file_reports_open_failure() {
        let mut fs = MockFs::with_file("present.bin", vec![1, 2, 3]);
        let mut buf = [0u8; 16];
        assert!(!read_file(&mut fs, &mut buf, 16, "missing.bin"));
    }

    #[test]
    fn read_file_aborts_on_mid_stream_error() {
        let mut fs = MockFs::with_file("big.bin", vec![7u8; 4096]);
        fs.fail_read_after = Some(2);

        let mut buf = [0u8; 4096];
        assert!(!read_file(&mut fs, &mut buf, 4096, "big.bin"));
    }

    #[test]
    fn read_file_reports_close_failure() {
        let mut fs = MockFs::with_file("tiny.bin", vec![9u8; 64]);
        fs.close_error = true;

        let mut buf = [0u8; 64];
        assert!(!read_file(&mut fs, &mut buf, 64, "tiny.bin"));
    }

    #[test]
    fn read_file_clamps_to_the_caller_buffer() {
        let mut fs = MockFs::with_file("big.bin", vec![3u8; 2048]);
        let mut buf = [0u8; 1024];
        assert!(read_file(&mut fs, &mut buf, 2048, "big.bin"));
        assert!(buf.iter().all(|&b| b == 3));
    }
}
