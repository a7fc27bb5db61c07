// ============================================================================
// src/ahci/hba.rs - AHCI Host Bus Adapter
// ============================================================================
//!
//! # HBA (Host Bus Adapter)
//!
//! コントローラ全体のレジスタ (GHC) を扱い、実装済みポートのレジスタ
//! ウィンドウを切り出す。PCI列挙は外部の責務で、ここはABAR（BAR5）の
//! MMIO空間を受け取るだけ。

use alloc::sync::Arc;

use crate::error::ErrorKind;
use crate::mmio::{MmioSpace, MmioWindow};
use crate::time::MonotonicClock;

use super::port::AhciPort;

// ============================================================================
// Global Host Control Registers
// ============================================================================

/// HBA Capabilities
pub const GHC_CAP: u64 = 0x00;
/// Global HBA Control
pub const GHC_GHC: u64 = 0x04;
/// Ports Implemented
pub const GHC_PI: u64 = 0x0C;
/// Version
pub const GHC_VS: u64 = 0x10;

/// GHC.AE - AHCI Enable
pub const GHC_AE: u32 = 1 << 31;

/// ポートレジスタ領域（ポート0の開始）
pub const PORT_BASE: u64 = 0x100;
/// 1ポートあたりのレジスタサイズ
pub const PORT_SIZE: u64 = 0x80;

// ============================================================================
// AHCI HBA
// ============================================================================

/// AHCIホストバスアダプタ
pub struct AhciHba<M: MmioSpace> {
    mmio: Arc<M>,
    /// 実装済みポートのビットマップ
    ports_implemented: u32,
    /// HBAがサポートするコマンドスロット数 (CAP.NCS + 1)
    command_slots: u8,
    /// バージョンレジスタの生値
    version: u32,
}

impl<M: MmioSpace> AhciHba<M> {
    /// HBAレジスタ空間からアダプタを作成
    pub fn new(mmio: Arc<M>) -> Self {
        let cap = mmio.read32(GHC_CAP);
        let pi = mmio.read32(GHC_PI);
        let vs = mmio.read32(GHC_VS);
        let command_slots = ((cap >> 8) & 0x1F) as u8 + 1;

        Self {
            mmio,
            ports_implemented: pi,
            command_slots,
            version: vs,
        }
    }

    /// AHCIモードを有効化する
    pub fn enable(&self) {
        let ghc = self.mmio.read32(GHC_GHC);
        self.mmio.write32(GHC_GHC, ghc | GHC_AE);
        log::info!(
            "AHCI {}.{} enabled, {} command slots, ports {:#010x}",
            self.version >> 16,
            self.version & 0xFFFF,
            self.command_slots,
            self.ports_implemented
        );
    }

    /// 実装済みポートのビットマップ
    pub fn ports_implemented(&self) -> u32 {
        self.ports_implemented
    }

    /// コマンドスロット数
    pub fn command_slots(&self) -> u8 {
        self.command_slots
    }

    /// ポートが実装されているか
    pub fn has_port(&self, port: u8) -> bool {
        port < 32 && self.ports_implemented & (1 << port) != 0
    }

    /// 指定ポートを初期化して返す
    pub fn open_port(
        &self,
        port: u8,
        clock: &dyn MonotonicClock,
    ) -> Result<AhciPort<MmioWindow<M>>, ErrorKind> {
        if !self.has_port(port) {
            // 未実装ポートは取り外し済みデバイスと同じ扱い
            return Err(ErrorKind::DeviceUnusable);
        }
        let window = MmioWindow::new(
            Arc::clone(&self.mmio),
            PORT_BASE + port as u64 * PORT_SIZE,
        );
        let mut ahci_port = AhciPort::new(window, self.command_slots);
        ahci_port.init(clock)?;
        Ok(ahci_port)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use spin::Mutex;
    use std::collections::HashMap;

    struct FlatMmio {
        regs: Mutex<HashMap<u64, u32>>,
    }

    impl MmioSpace for FlatMmio {
        fn read32(&self, offset: u64) -> u32 {
            *self.regs.lock().get(&offset).unwrap_or(&0)
        }
        fn write32(&self, offset: u64, value: u32) {
            self.regs.lock().insert(offset, value);
        }
    }

    fn make_hba(cap: u32, pi: u32) -> (Arc<FlatMmio>, AhciHba<FlatMmio>) {
        let mmio = Arc::new(FlatMmio { regs: Mutex::new(HashMap::new()) });
        mmio.write32(GHC_CAP, cap);
        mmio.write32(GHC_PI, pi);
        mmio.write32(GHC_VS, 0x0001_0301);
        let hba = AhciHba::new(Arc::clone(&mmio));
        (mmio, hba)
    }

    #[test]
    fn test_capability_decode() {
        // NCS=31 (32スロット)、ポート0と2が実装
        let (_mmio, hba) = make_hba(31 << 8, 0b101);
        assert_eq!(hba.command_slots(), 32);
        assert!(hba.has_port(0));
        assert!(!hba.has_port(1));
        assert!(hba.has_port(2));
        assert!(!hba.has_port(31));
    }

    #[test]
    fn test_enable_sets_ae() {
        let (mmio, hba) = make_hba(0, 1);
        hba.enable();
        assert_eq!(mmio.read32(GHC_GHC) & GHC_AE, GHC_AE);
    }

    #[test]
    fn test_port_window_offsets() {
        let (mmio, _hba) = make_hba(0, 0b10);
        let window = MmioWindow::new(Arc::clone(&mmio), PORT_BASE + PORT_SIZE);
        window.write32(0x18, 0xDEAD);
        // ポート1のPxCMD (0x100 + 0x80 + 0x18) に着弾している
        assert_eq!(mmio.read32(0x198), 0xDEAD);
    }
}
