//! Binary Loader.
//!
//! Loads flat guest images from disk and copies them into guest RAM. The
//! copy goes through [`Memory::copy_to_guest`], so any translated code over
//! the loaded range is invalidated before the CPU runs again.

use std::fs;
use std::path::Path;

use tracing::info;

use crate::common::addr::GuestAddress;
use crate::common::error::{EmuError, Result};
use crate::system::devices::address_space::effective_to_physical;
use crate::system::devices::Memory;

/// Reads a binary file from disk.
pub fn load_binary(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    Ok(fs::read(path)?)
}

/// Copies `data` to the effective address `load_addr`.
pub fn load_into(mem: &mut Memory, data: &[u8], load_addr: u32) -> Result<()> {
    let phys = effective_to_physical(load_addr, true);
    mem.copy_to_guest(phys, data)
        .ok_or(EmuError::ImageOutOfRange {
            addr: GuestAddress(load_addr),
            len: data.len(),
        })?;
    info!(
        addr = %GuestAddress(load_addr),
        bytes = data.len(),
        "guest image loaded"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_lands_at_the_physical_mirror() {
        let mut mem = Memory::with_sizes(0x1000, 0);
        load_into(&mut mem, &[1, 2, 3, 4], 0x8000_0100).unwrap();
        assert_eq!(mem.read_u32(0x100), Some(0x0102_0304));
        assert_eq!(mem.take_invalidations(), vec![(0x100, 4)]);
    }

    #[test]
    fn oversized_image_is_rejected() {
        let mut mem = Memory::with_sizes(0x1000, 0);
        let err = load_into(&mut mem, &[0; 0x20], 0x8000_0FF0).unwrap_err();
        assert!(matches!(err, EmuError::ImageOutOfRange { .. }));
    }
}
