//! Core discovery from the ACPI MADT.
//!
//! The RSDP is searched in the BIOS area, the RSDT or XSDT points at the
//! `APIC` table, and its entries list every local APIC. Table parsing works on
//! byte slices; only the scan of physical memory is bare-metal code.

use alloc::vec::Vec;
use kestrel_hal::Platform;

/// Default local APIC base when neither the MADT nor the MSR says otherwise.
pub const DEFAULT_LAPIC_BASE: u64 = 0xFEE0_0000;

const SDT_HEADER_LEN: usize = 36;
const MADT_ENTRIES: usize = SDT_HEADER_LEN + 8;
const MADT_LOCAL_APIC: u8 = 0;
const MADT_LAPIC_OVERRIDE: u8 = 5;
const LAPIC_ENABLED: u32 = 1;

/// What the firmware reports about the processors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInfo {
    /// Hardware ids of every enabled core, in table order.
    pub cores: Vec<u32>,
    /// Physical base of the local APIC registers.
    pub lapic_base: u64,
}

impl PlatformInfo {
    /// A single-core machine, used when no MADT is found.
    pub fn single_core(boot_id: u32, lapic_base: u64) -> Self {
        Self {
            cores: alloc::vec![boot_id],
            lapic_base,
        }
    }
}

impl Platform for PlatformInfo {
    fn core_ids(&self) -> &[u32] {
        &self.cores
    }

    fn local_apic_base(&self) -> u64 {
        self.lapic_base
    }
}

fn u32_at(bytes: &[u8], offset: usize) -> Option<u32> {
    let raw = bytes.get(offset..offset + 4)?;
    Some(u32::from_le_bytes(raw.try_into().ok()?))
}

fn u64_at(bytes: &[u8], offset: usize) -> Option<u64> {
    let raw = bytes.get(offset..offset + 8)?;
    Some(u64::from_le_bytes(raw.try_into().ok()?))
}

/// Whether the bytes sum to zero, as every ACPI checksum requires.
pub fn checksum_ok(bytes: &[u8]) -> bool {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b)) == 0
}

/// Parses a complete MADT (header included).
pub fn parse_madt(table: &[u8]) -> Option<PlatformInfo> {
    if table.get(0..4)? != b"APIC" {
        return None;
    }
    let length = (u32_at(table, 4)? as usize).min(table.len());
    let mut info = PlatformInfo {
        cores: Vec::new(),
        lapic_base: u64::from(u32_at(table, SDT_HEADER_LEN)?),
    };

    let mut offset = MADT_ENTRIES;
    while offset + 2 <= length {
        let kind = table[offset];
        let len = table[offset + 1] as usize;
        if len < 2 || offset + len > length {
            break;
        }
        let entry = &table[offset..offset + len];
        match kind {
            MADT_LOCAL_APIC if len >= 8 => {
                if u32_at(entry, 4)? & LAPIC_ENABLED != 0 {
                    info.cores.push(u32::from(entry[3]));
                }
            }
            MADT_LAPIC_OVERRIDE if len >= 12 => info.lapic_base = u64_at(entry, 4)?,
            _ => {}
        }
        offset += len;
    }
    Some(info)
}

/// Physical addresses of the tables listed by an RSDT (`wide == false`) or
/// XSDT (`wide == true`).
pub fn sdt_entries(table: &[u8], wide: bool) -> Vec<u64> {
    let length = u32_at(table, 4).map_or(0, |l| l as usize).min(table.len());
    let width = if wide { 8 } else { 4 };
    (SDT_HEADER_LEN..length)
        .step_by(width)
        .filter_map(|offset| {
            if wide {
                u64_at(table, offset)
            } else {
                u32_at(table, offset).map(u64::from)
            }
        })
        .collect()
}

#[cfg(target_os = "none")]
mod scan {
    use super::*;

    const BIOS_AREA: core::ops::Range<u64> = 0xE_0000..0x10_0000;
    const RSDP_LEN: usize = 20;
    const XSDP_LEN: usize = 36;

    /// Bytes at physical address `phys`.
    ///
    /// # Safety
    ///
    /// All physical memory must be mapped at `offset`.
    unsafe fn physical<'a>(offset: u64, phys: u64, len: usize) -> &'a [u8] {
        // SAFETY: upheld by the caller.
        unsafe { core::slice::from_raw_parts((offset + phys) as *const u8, len) }
    }

    /// A whole SDT at `phys`, sized by its header.
    unsafe fn table<'a>(offset: u64, phys: u64) -> &'a [u8] {
        // SAFETY: upheld by the caller.
        unsafe {
            let header = physical(offset, phys, SDT_HEADER_LEN);
            let len = u32_at(header, 4).map_or(SDT_HEADER_LEN, |l| l as usize);
            physical(offset, phys, len)
        }
    }

    /// Looks for the MADT.
    ///
    /// # Safety
    ///
    /// All physical memory must be mapped at `offset`.
    pub unsafe fn discover(offset: u64) -> Option<PlatformInfo> {
        // SAFETY: upheld by the caller.
        unsafe {
            let rsdp = BIOS_AREA.step_by(16).find_map(|phys| {
                let bytes = physical(offset, phys, RSDP_LEN);
                (bytes.starts_with(b"RSD PTR ") && checksum_ok(bytes)).then_some(phys)
            })?;
            let head = physical(offset, rsdp, XSDP_LEN);
            let (root, wide) = match u64_at(head, 24) {
                Some(xsdt) if head[15] >= 2 && xsdt != 0 => (xsdt, true),
                _ => (u64::from(u32_at(head, 16)?), false),
            };
            log::debug!("acpi: RSDP at {:#x}, root table at {:#x}", rsdp, root);

            sdt_entries(table(offset, root), wide)
                .into_iter()
                .map(|phys| table(offset, phys))
                .find(|t| t.starts_with(b"APIC"))
                .and_then(parse_madt)
        }
    }
}

#[cfg(target_os = "none")]
pub use scan::discover;
