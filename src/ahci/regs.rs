// ============================================================================
// src/ahci/regs.rs - AHCI Port Register Definitions
// ============================================================================
//!
//! AHCI 1.3.1 のポートレジスタオフセットとビット定義。
//!
//! ステータスワードから [`ErrorKind`] への変換はこのモジュールの
//! [`decode_port_error`] に集約する。トランスポート固有のビット
//! レイアウトを知ってよいのはここだけ。

use bitflags::bitflags;

use crate::error::ErrorKind;

// ============================================================================
// Port Register Offsets (relative to the port register window)
// ============================================================================

/// Command List Base Address
pub const PX_CLB: u64 = 0x00;
/// Command List Base Address Upper
pub const PX_CLBU: u64 = 0x04;
/// FIS Base Address
pub const PX_FB: u64 = 0x08;
/// FIS Base Address Upper
pub const PX_FBU: u64 = 0x0C;
/// Interrupt Status
pub const PX_IS: u64 = 0x10;
/// Interrupt Enable
pub const PX_IE: u64 = 0x14;
/// Command and Status
pub const PX_CMD: u64 = 0x18;
/// Task File Data
pub const PX_TFD: u64 = 0x20;
/// Signature
pub const PX_SIG: u64 = 0x24;
/// SATA Status
pub const PX_SSTS: u64 = 0x28;
/// SATA Control
pub const PX_SCTL: u64 = 0x2C;
/// SATA Error
pub const PX_SERR: u64 = 0x30;
/// SATA Active
pub const PX_SACT: u64 = 0x34;
/// Command Issue
pub const PX_CI: u64 = 0x38;

// ============================================================================
// Register Bits
// ============================================================================

bitflags! {
    /// PxCMD - Command and Status
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortCmd: u32 {
        /// Start
        const ST = 1 << 0;
        /// Spin-Up Device
        const SUD = 1 << 1;
        /// Power On Device
        const POD = 1 << 2;
        /// FIS Receive Enable
        const FRE = 1 << 4;
        /// FIS Receive Running
        const FR = 1 << 14;
        /// Command List Running
        const CR = 1 << 15;
    }
}

bitflags! {
    /// PxIS - Interrupt Status
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortIrq: u32 {
        /// Device to Host Register FIS
        const DHRS = 1 << 0;
        /// PIO Setup FIS
        const PSS = 1 << 1;
        /// DMA Setup FIS
        const DSS = 1 << 2;
        /// Set Device Bits
        const SDBS = 1 << 3;
        /// Overflow
        const OFS = 1 << 24;
        /// Interface Non-fatal Error
        const INFS = 1 << 26;
        /// Interface Fatal Error
        const IFS = 1 << 27;
        /// Host Bus Data Error
        const HBDS = 1 << 28;
        /// Host Bus Fatal Error
        const HBFS = 1 << 29;
        /// Task File Error
        const TFES = 1 << 30;
    }
}

bitflags! {
    /// PxSERR - SATA Error
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SataError: u32 {
        /// Recovered Data Integrity Error
        const ERR_I = 1 << 0;
        /// Recovered Communications Error
        const ERR_M = 1 << 1;
        /// Transient Data Integrity Error
        const ERR_T = 1 << 8;
        /// Persistent Communication Error
        const ERR_C = 1 << 9;
        /// Protocol Error
        const ERR_P = 1 << 10;
        /// Internal Error
        const ERR_E = 1 << 11;
    }
}

/// PxTFD ステータスビット
pub mod tfd_bits {
    /// Error
    pub const ERR: u32 = 1 << 0;
    /// Data Request
    pub const DRQ: u32 = 1 << 3;
    /// Busy
    pub const BSY: u32 = 1 << 7;
}

/// ATAエラーレジスタビット（PxTFD bits 15:8）
pub mod ata_error_bits {
    /// Command Aborted
    pub const ABRT: u8 = 1 << 2;
}

/// PxSCTL.DET 値
pub mod sctl_det {
    /// No device detection or initialization action requested
    pub const NONE: u32 = 0x0;
    /// Perform interface communication initialization sequence (COMRESET)
    pub const INIT: u32 = 0x1;
}

/// PxSSTS.DET 値
pub mod ssts_det {
    /// Device presence detected and Phy communication established
    pub const PRESENT: u32 = 0x3;
    pub const MASK: u32 = 0xF;
}

// ============================================================================
// Device Signatures
// ============================================================================

/// デバイスシグネチャ (PxSIG)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSignature {
    /// SATA drive
    Sata,
    /// SATAPI device (CD/DVD)
    Satapi,
    /// Enclosure management bridge
    Semb,
    /// Port multiplier
    PortMultiplier,
    /// Unknown / no device
    None,
}

impl DeviceSignature {
    pub fn from_raw(sig: u32) -> Self {
        match sig {
            0x0000_0101 => DeviceSignature::Sata,
            0xEB14_0101 => DeviceSignature::Satapi,
            0xC33C_0101 => DeviceSignature::Semb,
            0x9669_0101 => DeviceSignature::PortMultiplier,
            _ => DeviceSignature::None,
        }
    }
}

// ============================================================================
// Error Decode
// ============================================================================

/// 生のステータスレジスタ群から [`ErrorKind`] を導出する
///
/// 優先順位: ホストバス/インターフェース致命 → タスクファイルエラー →
/// 一時的インターフェース障害。何も立っていなければ `None`。
pub fn decode_port_error(is: PortIrq, tfd: u32, serr: SataError) -> Option<ErrorKind> {
    if is.intersects(PortIrq::IFS | PortIrq::HBFS) {
        return Some(ErrorKind::Fatal);
    }

    if is.contains(PortIrq::TFES) || (tfd & tfd_bits::ERR) != 0 {
        let ata_error = ((tfd >> 8) & 0xFF) as u8;
        return Some(ErrorKind::CommandError {
            code: ata_error as u16,
            // ABRT はデバイスによる能動的拒否: ブラインドリトライ対象外
            do_not_retry: ata_error & ata_error_bits::ABRT != 0,
        });
    }

    if is.intersects(PortIrq::HBDS | PortIrq::INFS | PortIrq::OFS)
        || serr.intersects(SataError::ERR_T | SataError::ERR_C | SataError::ERR_P)
    {
        return Some(ErrorKind::InterfaceError);
    }

    None
}

// ============================================================================
// Tests
// ============================================================================
