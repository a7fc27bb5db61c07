// ============================================================================
// src/ahci/port.rs - AHCI Port Transport
// ============================================================================
//!
//! # AHCIポート
//!
//! 個々のSATAポートを [`QueueTransport`] として実装する。
//!
//! コマンドリスト・コマンドテーブル・Received FISはポート初期化時に
//! 1回だけ割り当て、リセット時は同じアドレスで再装填する。
//! 完了検出はスロットの PxCI/PxSACT ビットのクリア、エラー判定は
//! PxTFD/PxIS/PxSERR のデコードによる。

use alloc::boxed::Box;
use core::ptr;

use crate::dma::DmaBuffer;
use crate::error::ErrorKind;
use crate::mmio::MmioSpace;
use crate::ring::SlotId;
use crate::time::{
    Deadline, MonotonicClock, COMMAND_TIMEOUT_NANOS, HALT_TIMEOUT_NANOS,
    LINK_RESET_TIMEOUT_NANOS, NANOS_PER_MILLI,
};
use crate::transport::{BlockCommand, BlockOp, CommandResult, QueueTransport};

use super::fis::{encode_trim_range, FisRegH2D};
use super::identify::IdentifyData;
use super::regs::*;

// ============================================================================
// Command Structures
// ============================================================================

/// Command Header (32バイト)
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct CommandHeader {
    /// DW0: CFL, A, W, P, R, B, C, PMP
    pub flags: u16,
    /// Physical Region Descriptor Table Length
    pub prdtl: u16,
    /// PRD Byte Count (completion側でハードウェアが転送量を書き込む)
    pub prdbc: u32,
    /// Command Table Base Address
    pub ctba: u32,
    /// Command Table Base Address Upper
    pub ctbau: u32,
    /// Reserved
    pub reserved: [u32; 4],
}

impl CommandHeader {
    /// フラグを設定
    pub fn set_flags(&mut self, cfl: u8, write: bool) {
        let mut flags = (cfl & 0x1F) as u16;
        if write {
            flags |= 1 << 6; // W bit
        }
        self.flags = flags;
    }

    /// Command Table アドレスを設定
    pub fn set_ctba(&mut self, addr: u64) {
        self.ctba = addr as u32;
        self.ctbau = (addr >> 32) as u32;
    }
}

/// Physical Region Descriptor (16バイト)
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct PhysicalRegionDescriptor {
    /// Data Base Address
    pub dba: u32,
    /// Data Base Address Upper
    pub dbau: u32,
    /// Reserved
    pub reserved: u32,
    /// Data Byte Count | Interrupt on Completion
    pub dbc: u32,
}

impl PhysicalRegionDescriptor {
    /// 新しいPRDを作成
    pub fn new(addr: u64, byte_count: u32) -> Self {
        Self {
            dba: addr as u32,
            dbau: (addr >> 32) as u32,
            reserved: 0,
            dbc: (byte_count - 1) & 0x3F_FFFF,
        }
    }
}

/// Command Table
#[repr(C, align(128))]
#[derive(Clone, Copy)]
pub struct CommandTable {
    /// Command FIS (64バイト)
    pub cfis: [u8; 64],
    /// ATAPI Command (16バイト)
    pub acmd: [u8; 16],
    /// Reserved (48バイト)
    pub reserved: [u8; 48],
    /// Physical Region Descriptor Table
    pub prdt: [PhysicalRegionDescriptor; 8],
}

impl Default for CommandTable {
    fn default() -> Self {
        Self {
            cfis: [0; 64],
            acmd: [0; 16],
            reserved: [0; 48],
            prdt: [PhysicalRegionDescriptor::default(); 8],
        }
    }
}

/// Received FIS Structure (256バイト)
#[repr(C, align(256))]
#[derive(Clone, Copy)]
pub struct ReceivedFis {
    /// DMA Setup FIS
    pub dsfis: [u8; 28],
    pub reserved0: [u8; 4],
    /// PIO Setup FIS
    pub psfis: [u8; 20],
    pub reserved1: [u8; 12],
    /// D2H Register FIS
    pub rfis: [u8; 20],
    pub reserved2: [u8; 4],
    /// Set Device Bits FIS
    pub sdbfis: [u8; 8],
    /// Unknown FIS
    pub ufis: [u8; 64],
    pub reserved3: [u8; 96],
}

impl Default for ReceivedFis {
    fn default() -> Self {
        Self {
            dsfis: [0; 28],
            reserved0: [0; 4],
            psfis: [0; 20],
            reserved1: [0; 12],
            rfis: [0; 20],
            reserved2: [0; 4],
            sdbfis: [0; 8],
            ufis: [0; 64],
            reserved3: [0; 96],
        }
    }
}

/// TRIM用DSMレンジペイロード（1セクタ = 64レンジ）
#[repr(C, align(512))]
#[derive(Clone, Copy)]
struct DsmPayload {
    ranges: [u64; 64],
}

impl Default for DsmPayload {
    fn default() -> Self {
        Self { ranges: [0; 64] }
    }
}

// ============================================================================
// AHCI Port
// ============================================================================

const SLOT_COUNT: usize = 32;

/// AHCIポート
///
/// `mmio` はこのポートのレジスタウィンドウ（PxCLBが+0x00）。
pub struct AhciPort<M: MmioSpace> {
    mmio: M,
    /// このHBAがサポートするコマンドスロット数 (CAP.NCS + 1)
    nslots: u8,
    /// 論理ブロックサイズ（IDENTIFYで更新される）
    block_size: u32,
    /// コマンドリスト
    command_list: Box<[CommandHeader; SLOT_COUNT]>,
    /// Received FIS
    received_fis: Box<ReceivedFis>,
    /// スロットごとのコマンドテーブル
    command_tables: Box<[CommandTable; SLOT_COUNT]>,
    /// スロットごとのTRIMレンジペイロード
    dsm_payloads: Box<[DsmPayload; SLOT_COUNT]>,
    /// ソフトウェアが発行済みとして追跡しているスロット
    active: u32,
    /// 最後に確認したデバイスシグネチャ
    signature: DeviceSignature,
}

impl<M: MmioSpace> AhciPort<M> {
    /// 新しいポートを作成（ハードウェアにはまだ触れない）
    pub fn new(mmio: M, nslots: u8) -> Self {
        Self {
            mmio,
            nslots: nslots.min(SLOT_COUNT as u8),
            block_size: 512,
            command_list: Box::new([CommandHeader::default(); SLOT_COUNT]),
            received_fis: Box::new(ReceivedFis::default()),
            command_tables: Box::new([CommandTable::default(); SLOT_COUNT]),
            dsm_payloads: Box::new([DsmPayload::default(); SLOT_COUNT]),
            active: 0,
            signature: DeviceSignature::None,
        }
    }

    /// ポートを初期化する
    ///
    /// 停止 → リング装填 → エラークリア → 始動 → シグネチャ確認。
    pub fn init(&mut self, clock: &dyn MonotonicClock) -> Result<(), ErrorKind> {
        self.halt(clock)?;
        self.rearm()?;
        self.clear_faults();
        self.restart(clock)?;
        self.verify_device()?;
        log::info!("AHCI port initialized, signature {:?}", self.signature);
        Ok(())
    }

    /// デバイスシグネチャ
    pub fn signature(&self) -> DeviceSignature {
        self.signature
    }

    /// 論理ブロックサイズ
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    fn read_port(&self, offset: u64) -> u32 {
        self.mmio.read32(offset)
    }

    fn write_port(&self, offset: u64, value: u32) {
        self.mmio.write32(offset, value)
    }

    fn fill_slot(&mut self, slot: usize, fis: &FisRegH2D, prd: Option<(u64, u32)>, write: bool) {
        let table = &mut self.command_tables[slot];
        *table = CommandTable::default();
        unsafe {
            ptr::copy_nonoverlapping(
                fis as *const _ as *const u8,
                table.cfis.as_mut_ptr(),
                core::mem::size_of::<FisRegH2D>(),
            );
        }

        let mut prdtl = 0;
        if let Some((addr, len)) = prd {
            table.prdt[0] = PhysicalRegionDescriptor::new(addr, len);
            prdtl = 1;
        }

        let table_addr = table as *const _ as u64;
        let header = &mut self.command_list[slot];
        header.set_flags(5, write); // CFL = 5 dwords
        header.prdtl = prdtl;
        header.prdbc = 0;
        header.set_ctba(table_addr);
    }

    /// IDENTIFY DEVICEを実行し、ブロックサイズを識別結果で更新する
    ///
    /// エンジン経由でない一回限りの同期コマンド。ポート初期化直後、
    /// ジオメトリ確定のために呼ぶ。
    pub fn identify(
        &mut self,
        clock: &dyn MonotonicClock,
        buf: &mut dyn DmaBuffer,
    ) -> Result<IdentifyData, ErrorKind> {
        if buf.len() < 512 {
            return Err(ErrorKind::InterfaceError);
        }

        let busy = self.hw_active_mask() | self.active;
        let slot = (0..self.nslots)
            .find(|i| busy & (1 << i) == 0)
            .ok_or(ErrorKind::InterfaceError)? as usize;

        let fis = FisRegH2D::identify();
        self.fill_slot(slot, &fis, Some((buf.device_addr(), 512)), false);
        self.write_port(PX_CI, 1 << slot);

        let deadline = Deadline::after(clock, COMMAND_TIMEOUT_NANOS);
        loop {
            if self.read_port(PX_CI) & (1 << slot) == 0 {
                let tfd = self.read_port(PX_TFD);
                let is = PortIrq::from_bits_truncate(self.read_port(PX_IS));
                let serr = SataError::from_bits_truncate(self.read_port(PX_SERR));
                if let Some(kind) = decode_port_error(is, tfd, serr) {
                    return Err(kind);
                }
                break;
            }
            if deadline.expired(clock) {
                return Err(ErrorKind::Timeout);
            }
            core::hint::spin_loop();
        }

        let data = IdentifyData::parse(buf.as_slice())?;
        self.block_size = data.block_size;
        Ok(data)
    }
}

impl<M: MmioSpace> QueueTransport for AhciPort<M> {
    fn slot_count(&self) -> u8 {
        self.nslots
    }

    fn hw_active_mask(&self) -> u32 {
        self.read_port(PX_SACT) | self.read_port(PX_CI)
    }

    fn issue(
        &mut self,
        slot: SlotId,
        cmd: &BlockCommand,
        buf: Option<&mut (dyn DmaBuffer + '_)>,
    ) -> Result<(), ErrorKind> {
        let idx = slot.as_usize();
        let byte_len = cmd.count.saturating_mul(self.block_size);

        match cmd.op {
            BlockOp::Read | BlockOp::Write => {
                let buf = buf.ok_or(ErrorKind::InterfaceError)?;
                if (buf.len() as u32) < byte_len {
                    return Err(ErrorKind::InterfaceError);
                }
                let fis = if cmd.op == BlockOp::Read {
                    FisRegH2D::read_dma_ext(cmd.lba, cmd.count as u16)
                } else {
                    FisRegH2D::write_dma_ext(cmd.lba, cmd.count as u16)
                };
                let write = cmd.op == BlockOp::Write;
                self.fill_slot(idx, &fis, Some((buf.device_addr(), byte_len)), write);
            }
            BlockOp::Flush => {
                let fis = FisRegH2D::flush_cache_ext();
                self.fill_slot(idx, &fis, None, false);
            }
            BlockOp::Trim => {
                self.dsm_payloads[idx] = DsmPayload::default();
                self.dsm_payloads[idx].ranges[0] =
                    encode_trim_range(cmd.lba, cmd.count as u16);
                let payload_addr = &self.dsm_payloads[idx] as *const _ as u64;
                let fis = FisRegH2D::data_set_management(1);
                self.fill_slot(idx, &fis, Some((payload_addr, 512)), true);
            }
        }

        // ドアベル: PxCIの該当ビットをセットするとハードウェアが
        // コマンドリストの消費を開始する
        self.write_port(PX_CI, slot.mask());
        self.active |= slot.mask();
        Ok(())
    }

    fn poll_completion(&mut self) -> Option<(SlotId, Result<CommandResult, ErrorKind>)> {
        if self.active == 0 {
            return None;
        }

        let busy = self.read_port(PX_CI) | self.read_port(PX_SACT);
        for i in 0..self.nslots {
            let mask = 1u32 << i;
            if self.active & mask == 0 || busy & mask != 0 {
                continue;
            }

            // スロットのCIビットが落ちた = 完了。エラー報告の有無を確認
            self.active &= !mask;
            let tfd = self.read_port(PX_TFD);
            let is = PortIrq::from_bits_truncate(self.read_port(PX_IS));
            let serr = SataError::from_bits_truncate(self.read_port(PX_SERR));

            let result = match decode_port_error(is, tfd, serr) {
                Some(kind) => Err(kind),
                None => Ok(CommandResult {
                    bytes_transferred: self.command_list[i as usize].prdbc,
                }),
            };
            return Some((SlotId(i), result));
        }
        None
    }

    fn probe_fault(&mut self) -> Option<ErrorKind> {
        let is = PortIrq::from_bits_truncate(self.read_port(PX_IS));
        let tfd = self.read_port(PX_TFD);
        let serr = SataError::from_bits_truncate(self.read_port(PX_SERR));

        // 完了待機中に即失敗扱いにするのは致命とタスクファイルエラーのみ。
        // 一時的なSERRビットは完了経路のデコードに任せる
        match decode_port_error(is, tfd, serr) {
            Some(kind @ ErrorKind::Fatal) | Some(kind @ ErrorKind::CommandError { .. }) => {
                Some(kind)
            }
            _ => None,
        }
    }

    fn clear_faults(&mut self) {
        self.write_port(PX_SERR, 0xFFFF_FFFF);
        self.write_port(PX_IS, 0xFFFF_FFFF);
    }

    fn halt(&mut self, clock: &dyn MonotonicClock) -> Result<(), ErrorKind> {
        // コマンド実行を停止
        let cmd = self.read_port(PX_CMD);
        self.write_port(PX_CMD, cmd & !PortCmd::ST.bits());

        let deadline = Deadline::after(clock, HALT_TIMEOUT_NANOS);
        while self.read_port(PX_CMD) & PortCmd::CR.bits() != 0 {
            if deadline.expired(clock) {
                return Err(ErrorKind::ResetFailed);
            }
            core::hint::spin_loop();
        }

        // FIS受信を停止
        let cmd = self.read_port(PX_CMD);
        self.write_port(PX_CMD, cmd & !PortCmd::FRE.bits());

        let deadline = Deadline::after(clock, HALT_TIMEOUT_NANOS);
        while self.read_port(PX_CMD) & PortCmd::FR.bits() != 0 {
            if deadline.expired(clock) {
                return Err(ErrorKind::ResetFailed);
            }
            core::hint::spin_loop();
        }
        Ok(())
    }

    fn link_reset(&mut self, clock: &dyn MonotonicClock) -> Result<(), ErrorKind> {
        // COMRESET: DETをINITに立ててからNONEへ戻す
        let sctl = self.read_port(PX_SCTL);
        self.write_port(PX_SCTL, (sctl & !0xF) | sctl_det::INIT);
        clock.sleep_nanos(NANOS_PER_MILLI);
        self.write_port(PX_SCTL, sctl & !0xF);

        // デバイス存在確認
        let deadline = Deadline::after(clock, LINK_RESET_TIMEOUT_NANOS);
        while self.read_port(PX_SSTS) & ssts_det::MASK != ssts_det::PRESENT {
            if deadline.expired(clock) {
                return Err(ErrorKind::ResetFailed);
            }
            core::hint::spin_loop();
        }

        // COMRESETで立った診断ビットを掃除
        self.write_port(PX_SERR, 0xFFFF_FFFF);
        Ok(())
    }

    fn verify_device(&mut self) -> Result<(), ErrorKind> {
        let sig = DeviceSignature::from_raw(self.read_port(PX_SIG));
        self.signature = sig;
        match sig {
            DeviceSignature::Sata => Ok(()),
            _ => Err(ErrorKind::ResetFailed),
        }
    }

    fn rearm(&mut self) -> Result<(), ErrorKind> {
        // 元のアドレスで再装填（再割り当てしない）
        let clb = self.command_list.as_ptr() as u64;
        let fb = self.received_fis.as_ref() as *const _ as u64;
        self.mmio.write64_split(PX_CLB, PX_CLBU, clb);
        self.mmio.write64_split(PX_FB, PX_FBU, fb);

        *self.command_list = [CommandHeader::default(); SLOT_COUNT];
        self.active = 0;
        Ok(())
    }

    fn restart(&mut self, _clock: &dyn MonotonicClock) -> Result<(), ErrorKind> {
        // FIS受信 → コマンド実行の順に有効化
        let cmd = self.read_port(PX_CMD);
        self.write_port(PX_CMD, cmd | PortCmd::FRE.bits());
        let cmd = self.read_port(PX_CMD);
        self.write_port(PX_CMD, cmd | PortCmd::ST.bits());
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::{DmaBuffer, IdentityBuffer};
    use crate::time::Nanoseconds;
    use core::sync::atomic::{AtomicU64, Ordering};
    use spin::Mutex;
    use std::collections::HashMap;

    struct TestClock {
        now: AtomicU64,
    }

    impl TestClock {
        fn new() -> Self {
            Self { now: AtomicU64::new(0) }
        }
    }

    impl MonotonicClock for TestClock {
        fn uptime_nanos(&self) -> Nanoseconds {
            self.now.fetch_add(1_000, Ordering::Relaxed)
        }
        fn sleep_nanos(&self, nanos: Nanoseconds) {
            self.now.fetch_add(nanos, Ordering::Relaxed);
        }
    }

    /// 発行されたコマンドが即完了するHBAポートのレジスタ模型
    struct FakeHba {
        regs: Mutex<HashMap<u64, u32>>,
    }

    impl FakeHba {
        fn new() -> Self {
            Self { regs: Mutex::new(HashMap::new()) }
        }

        fn set(&self, offset: u64, value: u32) {
            self.regs.lock().insert(offset, value);
        }

        fn get(&self, offset: u64) -> u32 {
            *self.regs.lock().get(&offset).unwrap_or(&0)
        }
    }

    impl MmioSpace for FakeHba {
        fn read32(&self, offset: u64) -> u32 {
            let regs = self.regs.lock();
            match offset {
                // 発行済みコマンドは即座に消費される
                PX_CI | PX_SACT => 0,
                PX_SSTS => ssts_det::PRESENT,
                PX_SIG => 0x0000_0101, // SATA
                PX_TFD => *regs.get(&PX_TFD).unwrap_or(&0x50), // DRDY
                _ => *regs.get(&offset).unwrap_or(&0),
            }
        }

        fn write32(&self, offset: u64, value: u32) {
            self.regs.lock().insert(offset, value);
        }
    }

    fn make_port() -> (AhciPort<&'static FakeHba>, &'static FakeHba, TestClock) {
        let hba: &'static FakeHba = Box::leak(Box::new(FakeHba::new()));
        let clock = TestClock::new();
        let mut port = AhciPort::new(hba, 32);
        port.init(&clock).expect("port init succeeds");
        (port, hba, clock)
    }

    impl MmioSpace for &'static FakeHba {
        fn read32(&self, offset: u64) -> u32 {
            (**self).read32(offset)
        }
        fn write32(&self, offset: u64, value: u32) {
            (**self).write32(offset, value)
        }
    }

    #[test]
    fn test_init_programs_rings_and_signature() {
        let (port, hba, _clock) = make_port();
        assert_eq!(port.signature(), DeviceSignature::Sata);
        // リングアドレスがレジスタへ分割書き込みされている
        let clb = (hba.get(PX_CLB) as u64) | ((hba.get(PX_CLBU) as u64) << 32);
        assert_eq!(clb, port.command_list.as_ptr() as u64);
        // SERRとISがクリアされている
        assert_eq!(hba.get(PX_SERR), 0xFFFF_FFFF);
    }

    #[test]
    fn test_issue_rings_doorbell_and_completes() {
        let (mut port, hba, _clock) = make_port();
        let mut buf = IdentityBuffer::new(4 * 512).unwrap();

        port.issue(SlotId(2), &BlockCommand::read(64, 4), Some(&mut buf))
            .unwrap();
        // ドアベル: PxCIにスロット2のビットが書かれた
        assert_eq!(hba.get(PX_CI), 1 << 2);

        let (slot, result) = port.poll_completion().expect("command completes");
        assert_eq!(slot, SlotId(2));
        assert!(result.is_ok());
        assert!(port.poll_completion().is_none());
    }

    #[test]
    fn test_taskfile_error_decoded_on_completion() {
        let (mut port, hba, _clock) = make_port();
        // ERRビット + エラーレジスタABRT
        hba.set(PX_TFD, tfd_bits::ERR | ((ata_error_bits::ABRT as u32) << 8));
        hba.set(PX_IS, PortIrq::TFES.bits());

        port.issue(SlotId(0), &BlockCommand::flush(), None).unwrap();
        let (_, result) = port.poll_completion().unwrap();
        assert_eq!(
            result,
            Err(ErrorKind::CommandError { code: 0x04, do_not_retry: true })
        );
        // probe_faultも同じ状態を即検出する
        assert!(matches!(
            port.probe_fault(),
            Some(ErrorKind::CommandError { .. })
        ));
    }

    #[test]
    fn test_trim_builds_dsm_payload() {
        let (mut port, _hba, _clock) = make_port();
        port.issue(SlotId(1), &BlockCommand::trim(0x2000, 16), None)
            .unwrap();
        assert_eq!(port.dsm_payloads[1].ranges[0], encode_trim_range(0x2000, 16));
        let (slot, result) = port.poll_completion().unwrap();
        assert_eq!(slot, SlotId(1));
        assert!(result.is_ok());
    }

    #[test]
    fn test_comreset_toggles_det() {
        let (mut port, hba, clock) = make_port();
        port.link_reset(&clock).unwrap();
        // DETはNONEへ戻されている
        assert_eq!(hba.get(PX_SCTL) & 0xF, sctl_det::NONE);
        // 診断ビットの掃除
        assert_eq!(hba.get(PX_SERR), 0xFFFF_FFFF);
    }

    #[test]
    fn test_full_reset_sequence() {
        let (mut port, _hba, clock) = make_port();
        port.halt(&clock).unwrap();
        port.clear_faults();
        port.link_reset(&clock).unwrap();
        port.verify_device().unwrap();
        port.rearm().unwrap();
        port.restart(&clock).unwrap();

        // リセット後も発行できる
        let mut buf = IdentityBuffer::new(512).unwrap();
        port.issue(SlotId(0), &BlockCommand::write(0, 1), Some(&mut buf))
            .unwrap();
        assert!(port.poll_completion().is_some());
    }
}
