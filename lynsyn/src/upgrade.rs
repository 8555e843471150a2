//! Firmware upgrades over USB.
//!
//! The host erases the upgrade area, streams the new image in blocks of
//! [`FLASH_BUFFER_SIZE`] bytes and finally sends the sum of all 32-bit words it sent. Only if the
//! sum matches is the image marked for the bootloader to install.

use crate::protocol::FLASH_BUFFER_SIZE;

/// Errors of the upgrade procedure.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum UpgradeError {
    /// No firmware store is attached.
    NoFirmwareStore,

    /// No upgrade was started.
    NotStarted,

    /// The image does not fit into the upgrade area of {capacity} bytes.
    ImageTooLarge { capacity: usize },

    /// Incorrect checksum {received:#010x}, the image sums to {computed:#010x}.
    ChecksumMismatch { received: u32, computed: u32 },

    /// Flash access failed
    Flash(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// The flash area that receives a new firmware image.
pub trait FirmwareStore {
    /// Bytes available for the image.
    fn capacity(&self) -> usize;

    /// Erases the whole area.
    fn erase(&mut self) -> Result<(), UpgradeError>;

    /// Writes `data` at `offset` into the area.
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), UpgradeError>;

    /// Marks the stored image for installation on the next boot.
    fn mark_for_install(&mut self) -> Result<(), UpgradeError>;
}

/// Adds the little endian words of `data` to `sum`.
pub fn word_sum(sum: u32, data: &[u8]) -> u32 {
    data.chunks(4).fold(sum, |sum, word| {
        let mut bytes = [0; 4];
        bytes[..word.len()].copy_from_slice(word);
        sum.wrapping_add(u32::from_le_bytes(bytes))
    })
}

/// State of an upgrade in progress.
#[derive(Debug, Clone, Default)]
pub struct Upgrade {
    started: bool,
    blocks: usize,
    sum: u32,
}

impl Upgrade {
    /// Creates an idle upgrade.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks stored since [`Upgrade::init`].
    pub fn blocks(&self) -> usize {
        self.blocks
    }

    /// Erases the upgrade area and starts a new image.
    pub fn init(&mut self, store: &mut dyn FirmwareStore) -> Result<(), UpgradeError> {
        store.erase()?;
        *self = Self {
            started: true,
            ..Default::default()
        };

        tracing::info!("Receiving new firmware...");
        Ok(())
    }

    /// Stores the next block of the image.
    pub fn store(
        &mut self,
        store: &mut dyn FirmwareStore,
        data: &[u8; FLASH_BUFFER_SIZE],
    ) -> Result<(), UpgradeError> {
        if !self.started {
            return Err(UpgradeError::NotStarted);
        }

        let offset = self.blocks * FLASH_BUFFER_SIZE;
        if offset + FLASH_BUFFER_SIZE > store.capacity() {
            return Err(UpgradeError::ImageTooLarge {
                capacity: store.capacity(),
            });
        }

        store.write(offset, data)?;
        self.sum = word_sum(self.sum, data);
        self.blocks += 1;
        Ok(())
    }

    /// Checks the image against `checksum` and marks it for installation.
    ///
    /// The upgrade ends either way. On success the caller is expected to reset the device.
    pub fn finalise(
        &mut self,
        store: &mut dyn FirmwareStore,
        checksum: u32,
    ) -> Result<(), UpgradeError> {
        if !std::mem::take(&mut self.started) {
            return Err(UpgradeError::NotStarted);
        }

        tracing::info!("New firmware received, {} blocks", self.blocks);

        if checksum != self.sum {
            tracing::warn!("Incorrect CRC, not upgrading");
            return Err(UpgradeError::ChecksumMismatch {
                received: checksum,
                computed: self.sum,
            });
        }

        store.mark_for_install()
    }
}

#[cfg(any(test, feature = "test"))]
pub mod fake {
    #![allow(missing_docs)]
    //! A firmware store in RAM.

    use super::*;

    #[derive(Debug, Clone, Default)]
    pub struct MemoryFirmwareStore {
        pub image: Vec<u8>,
        pub erased: usize,
        pub marked: bool,
    }

    impl MemoryFirmwareStore {
        pub fn new(capacity: usize) -> Self {
            Self {
                image: vec![0xff; capacity],
                ..Default::default()
            }
        }
    }

    impl FirmwareStore for MemoryFirmwareStore {
        fn capacity(&self) -> usize {
            self.image.len()
        }

        fn erase(&mut self) -> Result<(), UpgradeError> {
            self.image.fill(0xff);
            self.erased += 1;
            self.marked = false;
            Ok(())
        }

        fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), UpgradeError> {
            self.image[offset..offset + data.len()].copy_from_slice(data);
            Ok(())
        }

        fn mark_for_install(&mut self) -> Result<(), UpgradeError> {
            self.marked = true;
            Ok(())
        }
    }
}
