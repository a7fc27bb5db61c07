// ============================================================================
// src/nvme/ctrl.rs - NVMe Controller Transport
// ============================================================================
//!
//! # NVMeコントローラ
//!
//! 管理キュー (qid 0) とI/Oキューペア (qid 1) を持つ単一ネームスペース
//! コントローラ。I/Oキューペアをエンジンの [`QueueTransport`] として
//! 実装する。
//!
//! ## リセット手順のNVMeへの写像
//! - halt: CC.EN=0 を書き、CSTS.RDY の追従を CAP.TO 以内で確認
//! - clear_faults: CSTS.NSSRO (RW1C) をクリア
//! - link_reset: 無効状態のまま管理キューを再装填し AQA/ASQ/ACQ/CC を再設定
//! - verify_device: VS/CSTS の妥当性確認（CFSが立っていないこと）
//! - rearm: I/Oリングの再初期化
//! - restart: CC.EN=1 → RDY確認 → 管理コマンドでI/Oキューを再作成

use alloc::boxed::Box;
use alloc::sync::Arc;

use crate::dma::DmaBuffer;
use crate::error::ErrorKind;
use crate::mmio::MmioSpace;
use crate::ring::SlotId;
use crate::time::{Deadline, MonotonicClock, COMMAND_TIMEOUT_NANOS};
use crate::transport::{BlockCommand, BlockOp, CommandResult, QueueTransport};

use super::cmd::{decode_status, DsmRange, NvmeCommand, NvmeCompletion};
use super::queue::NvmeQueuePair;
use super::regs::{offsets, CcFlags, CstsFlags, NvmeCapabilities};

/// 管理キュー深度
const ADMIN_QUEUE_DEPTH: u16 = 32;

/// ホストページサイズ (CC.MPS=0)
const PAGE_SIZE: u64 = 4096;

/// エンジンへ公開するスロット数の上限
const MAX_SLOTS: usize = 32;

/// 単一ネームスペースNVMeコントローラ
pub struct NvmeController<M: MmioSpace> {
    mmio: Arc<M>,
    cap: NvmeCapabilities,
    admin: NvmeQueuePair<M>,
    io: NvmeQueuePair<M>,
    /// 対象ネームスペース (通常1)
    nsid: u32,
    /// 論理ブロックサイズ（Identify Namespaceで更新される）
    block_size: u32,
    next_admin_cid: u16,
    /// スロットごとの転送バイト数（CQEは転送量を運ばないため発行時に控える）
    pending_bytes: [u32; MAX_SLOTS],
    /// スロットごとのDeallocateレンジペイロード
    dsm_ranges: Box<[DsmRange; MAX_SLOTS]>,
}

impl<M: MmioSpace> NvmeController<M> {
    /// 新しいコントローラを作成（ハードウェアにはまだ触れない）
    pub fn new(mmio: Arc<M>, io_depth: u16) -> Option<Self> {
        let cap = NvmeCapabilities::new(mmio.read64(offsets::CAP));
        let stride = cap.doorbell_stride();
        let io_depth = io_depth.min(cap.max_queue_entries()).max(2);

        let admin = NvmeQueuePair::new(Arc::clone(&mmio), 0, ADMIN_QUEUE_DEPTH, stride)?;
        let io = NvmeQueuePair::new(Arc::clone(&mmio), 1, io_depth, stride)?;

        Some(Self {
            mmio,
            cap,
            admin,
            io,
            nsid: 1,
            block_size: 512,
            next_admin_cid: 0,
            pending_bytes: [0; MAX_SLOTS],
            dsm_ranges: Box::new([DsmRange::default(); MAX_SLOTS]),
        })
    }

    /// コントローラを初期化する
    ///
    /// 無効化 → 管理キュー装填 → 有効化 → I/Oキュー作成。
    pub fn init(&mut self, clock: &dyn MonotonicClock) -> Result<(), ErrorKind> {
        self.disable(clock)?;
        self.program_admin_queue();
        self.enable(clock)?;
        self.create_io_queues(clock)?;
        log::info!(
            "NVMe controller initialized, io queue depth {}",
            self.io.depth()
        );
        Ok(())
    }

    /// 論理ブロックサイズ
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    fn disable(&self, clock: &dyn MonotonicClock) -> Result<(), ErrorKind> {
        let cc = self.mmio.read32(offsets::CC);
        self.mmio.write32(offsets::CC, cc & !CcFlags::EN.bits());

        let deadline = Deadline::after(clock, self.cap.ready_timeout());
        while self.mmio.read32(offsets::CSTS) & CstsFlags::RDY.bits() != 0 {
            if deadline.expired(clock) {
                return Err(ErrorKind::ResetFailed);
            }
            core::hint::spin_loop();
        }
        Ok(())
    }

    fn enable(&self, clock: &dyn MonotonicClock) -> Result<(), ErrorKind> {
        let cc = self.mmio.read32(offsets::CC);
        self.mmio.write32(offsets::CC, cc | CcFlags::EN.bits());

        let deadline = Deadline::after(clock, self.cap.ready_timeout());
        loop {
            let csts = self.mmio.read32(offsets::CSTS);
            if csts & CstsFlags::CFS.bits() != 0 {
                return Err(ErrorKind::ResetFailed);
            }
            if csts & CstsFlags::RDY.bits() != 0 {
                return Ok(());
            }
            if deadline.expired(clock) {
                return Err(ErrorKind::ResetFailed);
            }
            core::hint::spin_loop();
        }
    }

    fn program_admin_queue(&self) {
        // AQA: CQサイズ (27:16) | SQサイズ (11:0)、いずれも0-based
        let depth = (ADMIN_QUEUE_DEPTH - 1) as u32;
        self.mmio.write32(offsets::AQA, (depth << 16) | depth);
        self.mmio
            .write64_split(offsets::ASQ, offsets::ASQ + 4, self.admin.sq_addr());
        self.mmio
            .write64_split(offsets::ACQ, offsets::ACQ + 4, self.admin.cq_addr());

        // エントリサイズのみ設定（ENはenable()で立てる）
        self.mmio.write32(
            offsets::CC,
            (CcFlags::IOSQES_64 | CcFlags::IOCQES_16).bits(),
        );
    }

    fn alloc_admin_cid(&mut self) -> u16 {
        let cid = self.next_admin_cid;
        self.next_admin_cid = self.next_admin_cid.wrapping_add(1) % ADMIN_QUEUE_DEPTH;
        cid
    }

    /// 管理コマンドを発行し完了を同期待機する
    fn admin_execute(
        &mut self,
        clock: &dyn MonotonicClock,
        cmd: NvmeCommand,
    ) -> Result<NvmeCompletion, ErrorKind> {
        let cid = cmd.cid();
        self.admin
            .submit(&cmd)
            .ok_or(ErrorKind::InterfaceError)?;

        let deadline = Deadline::after(clock, COMMAND_TIMEOUT_NANOS);
        loop {
            if let Some(completion) = self.admin.consume() {
                if completion.cid == cid {
                    decode_status(&completion)?;
                    return Ok(completion);
                }
                // 別の管理コマンドの完了はここでは来ない前提（逐次発行）
                log::warn!("unexpected admin completion cid {}", completion.cid);
            }
            if self.mmio.read32(offsets::CSTS) & CstsFlags::CFS.bits() != 0 {
                return Err(ErrorKind::Fatal);
            }
            if deadline.expired(clock) {
                return Err(ErrorKind::Timeout);
            }
            core::hint::spin_loop();
        }
    }

    fn create_io_queues(&mut self, clock: &dyn MonotonicClock) -> Result<(), ErrorKind> {
        let depth = self.io.depth();
        let cq_addr = self.io.cq_addr();
        let sq_addr = self.io.sq_addr();

        // CQを先に作る（SQは作成時にCQIDを参照する）
        let cid = self.alloc_admin_cid();
        self.admin_execute(clock, NvmeCommand::create_io_cq(cid, 1, depth, cq_addr))?;
        let cid = self.alloc_admin_cid();
        self.admin_execute(clock, NvmeCommand::create_io_sq(cid, 1, depth, sq_addr, 1))?;
        Ok(())
    }

    /// Identify Namespaceを実行し (総ブロック数, ブロックサイズ) を返す
    ///
    /// `buf` は4096バイト以上であること。ブロックサイズは内部状態にも
    /// 反映される。
    pub fn identify_namespace(
        &mut self,
        clock: &dyn MonotonicClock,
        buf: &mut dyn DmaBuffer,
    ) -> Result<(u64, u32), ErrorKind> {
        if buf.len() < 4096 {
            return Err(ErrorKind::InterfaceError);
        }

        let cid = self.alloc_admin_cid();
        let cmd = NvmeCommand::identify_namespace(cid, self.nsid, buf.device_addr());
        self.admin_execute(clock, cmd)?;

        let data = buf.as_slice();
        let nsze = u64::from_le_bytes(data[0..8].try_into().unwrap_or([0; 8]));
        // FLBAS (byte 26) 下位4ビットが現用LBAフォーマット番号、
        // フォーマット記述子はオフセット128から4バイトずつ、LBADSは第3バイト
        let flbas = (data[26] & 0xF) as usize;
        let lbads = data[128 + flbas * 4 + 2];
        let block_size = 1u32 << lbads.clamp(9, 16);

        self.block_size = block_size;
        Ok((nsze, block_size))
    }

    fn prp_pair(&self, addr: u64, byte_len: u32) -> Result<(u64, u64), ErrorKind> {
        if byte_len as u64 <= PAGE_SIZE {
            Ok((addr, 0))
        } else if byte_len as u64 <= 2 * PAGE_SIZE {
            Ok((addr, addr + PAGE_SIZE))
        } else {
            // PRPリスト未対応: フロントエンドのmax_blocksで抑止される
            Err(ErrorKind::CommandError { code: 0xFF, do_not_retry: true })
        }
    }
}

impl<M: MmioSpace> QueueTransport for NvmeController<M> {
    fn slot_count(&self) -> u8 {
        // SQはhead==tailを空と区別するため depth-1 件まで
        ((self.io.depth() - 1) as usize).min(MAX_SLOTS) as u8
    }

    fn hw_active_mask(&self) -> u32 {
        // NVMeはハードウェア側のスロット占有表示を持たない
        0
    }

    fn issue(
        &mut self,
        slot: SlotId,
        cmd: &BlockCommand,
        buf: Option<&mut (dyn DmaBuffer + '_)>,
    ) -> Result<(), ErrorKind> {
        let cid = slot.as_u16();
        let byte_len = cmd.count.saturating_mul(self.block_size);

        let sqe = match cmd.op {
            BlockOp::Read | BlockOp::Write => {
                let buf = buf.ok_or(ErrorKind::InterfaceError)?;
                if (buf.len() as u32) < byte_len || cmd.count == 0 {
                    return Err(ErrorKind::InterfaceError);
                }
                let (prp1, prp2) = self.prp_pair(buf.device_addr(), byte_len)?;
                let nlb = (cmd.count - 1) as u16;
                if cmd.op == BlockOp::Read {
                    NvmeCommand::read(cid, self.nsid, cmd.lba, nlb, prp1, prp2)
                } else {
                    NvmeCommand::write(cid, self.nsid, cmd.lba, nlb, prp1, prp2)
                }
            }
            BlockOp::Flush => NvmeCommand::flush(cid, self.nsid),
            BlockOp::Trim => {
                self.dsm_ranges[slot.as_usize()] = DsmRange::new(cmd.lba, cmd.count);
                let prp1 = &self.dsm_ranges[slot.as_usize()] as *const _ as u64;
                NvmeCommand::dataset_management(cid, self.nsid, 0, prp1)
            }
        };

        self.pending_bytes[slot.as_usize()] = if cmd.op.has_data() { byte_len } else { 0 };
        self.io.submit(&sqe).ok_or(ErrorKind::InterfaceError)?;
        Ok(())
    }

    fn poll_completion(&mut self) -> Option<(SlotId, Result<CommandResult, ErrorKind>)> {
        let completion = self.io.consume()?;
        let cid = completion.cid;
        if cid as usize >= MAX_SLOTS {
            log::warn!("completion with out-of-range cid {}", cid);
            return None;
        }

        let slot = SlotId(cid as u8);
        let result = match decode_status(&completion) {
            Ok(()) => Ok(CommandResult {
                bytes_transferred: self.pending_bytes[slot.as_usize()],
            }),
            Err(kind) => Err(kind),
        };
        Some((slot, result))
    }

    fn probe_fault(&mut self) -> Option<ErrorKind> {
        let csts = self.mmio.read32(offsets::CSTS);
        if csts & CstsFlags::CFS.bits() != 0 {
            Some(ErrorKind::Fatal)
        } else {
            None
        }
    }

    fn clear_faults(&mut self) {
        // NSSROはRW1C。それ以外にクリア対象のstickyビットはない
        self.mmio.write32(offsets::CSTS, CstsFlags::NSSRO.bits());
    }

    fn halt(&mut self, clock: &dyn MonotonicClock) -> Result<(), ErrorKind> {
        self.disable(clock)
    }

    fn link_reset(&mut self, _clock: &dyn MonotonicClock) -> Result<(), ErrorKind> {
        // 無効状態でのみ管理キューレジスタを書き換えられる
        self.admin.reinit();
        self.program_admin_queue();
        Ok(())
    }

    fn verify_device(&mut self) -> Result<(), ErrorKind> {
        let vs = self.mmio.read32(offsets::VS);
        if vs == 0 || vs == u32::MAX {
            return Err(ErrorKind::ResetFailed);
        }
        if self.mmio.read32(offsets::CSTS) & CstsFlags::CFS.bits() != 0 {
            return Err(ErrorKind::ResetFailed);
        }
        Ok(())
    }

    fn rearm(&mut self) -> Result<(), ErrorKind> {
        self.io.reinit();
        self.pending_bytes = [0; MAX_SLOTS];
        Ok(())
    }

    fn restart(&mut self, clock: &dyn MonotonicClock) -> Result<(), ErrorKind> {
        self.enable(clock)?;
        // コントローラはリセットでI/Oキューを忘れているため再作成する
        self.create_io_queues(clock)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::IdentityBuffer;
    use crate::time::Nanoseconds;
    use core::ptr;
    use core::sync::atomic::{AtomicU64, Ordering};
    use spin::Mutex;

    struct TestClock {
        now: AtomicU64,
    }

    impl MonotonicClock for TestClock {
        fn uptime_nanos(&self) -> Nanoseconds {
            self.now.fetch_add(1_000, Ordering::Relaxed)
        }
        fn sleep_nanos(&self, nanos: Nanoseconds) {
            self.now.fetch_add(nanos, Ordering::Relaxed);
        }
    }

    /// レジスタ挙動とキュー消費を模したNVMeデバイスモデル
    ///
    /// - CC.ENの書き込みにCSTS.RDYが即座に追従する
    /// - SQドアベルの書き込みでSQEを読み、成功CQEを書き込む
    struct FakeNvme {
        state: Mutex<FakeState>,
    }

    struct FakeState {
        cc: u32,
        asq: [u32; 2],
        acq: [u32; 2],
        admin_head: u16,
        admin_phase: bool,
        io_sq_addr: u64,
        io_cq_addr: u64,
        io_depth: u16,
        io_head: u16,
        io_cq_tail: u16,
        io_phase: bool,
        /// 次のI/O完了に載せるステータス (DW3上位16bitのphase抜き)
        io_status: u16,
    }

    impl FakeNvme {
        fn new() -> Self {
            Self {
                state: Mutex::new(FakeState {
                    cc: 0,
                    asq: [0; 2],
                    acq: [0; 2],
                    admin_head: 0,
                    admin_phase: true,
                    io_sq_addr: 0,
                    io_cq_addr: 0,
                    io_depth: 0,
                    io_head: 0,
                    io_cq_tail: 0,
                    io_phase: true,
                    io_status: 0,
                }),
            }
        }

        fn set_io_status(&self, status: u16) {
            self.state.lock().io_status = status;
        }

        /// 管理SQEを処理して成功CQEを書く
        fn process_admin(&self, state: &mut FakeState, new_tail: u16) {
            let asq = (state.asq[0] as u64) | ((state.asq[1] as u64) << 32);
            let acq = (state.acq[0] as u64) | ((state.acq[1] as u64) << 32);
            while state.admin_head != new_tail {
                let sqe = unsafe {
                    ptr::read_volatile((asq + state.admin_head as u64 * 64) as *const NvmeCommand)
                };
                // I/Oキュー作成コマンドからリングの所在を学習する
                match sqe.opcode() {
                    0x05 => {
                        state.io_cq_addr = sqe.dptr1;
                        state.io_depth = (sqe.cdw10 & 0xFFFF) as u16 + 1;
                    }
                    0x01 => state.io_sq_addr = sqe.dptr1,
                    _ => {}
                }
                state.admin_head = (state.admin_head + 1) % ADMIN_QUEUE_DEPTH;

                let cqe = NvmeCompletion {
                    sq_head: state.admin_head,
                    cid: sqe.cid(),
                    status: if state.admin_phase { 1 } else { 0 },
                    ..Default::default()
                };
                let idx = state.admin_head.wrapping_sub(1) % ADMIN_QUEUE_DEPTH;
                unsafe {
                    ptr::write_volatile((acq + idx as u64 * 16) as *mut NvmeCompletion, cqe)
                };
                if idx as u16 == ADMIN_QUEUE_DEPTH - 1 {
                    state.admin_phase = !state.admin_phase;
                }
            }
        }

        /// I/O SQEを処理してCQEを書く
        fn process_io(&self, state: &mut FakeState, new_tail: u16) {
            while state.io_head != new_tail {
                let sqe = unsafe {
                    ptr::read_volatile(
                        (state.io_sq_addr + state.io_head as u64 * 64) as *const NvmeCommand,
                    )
                };
                state.io_head = (state.io_head + 1) % state.io_depth;

                let status = state.io_status << 1 | if state.io_phase { 1 } else { 0 };
                let cqe = NvmeCompletion {
                    sq_head: state.io_head,
                    sq_id: 1,
                    cid: sqe.cid(),
                    status,
                    ..Default::default()
                };
                unsafe {
                    ptr::write_volatile(
                        (state.io_cq_addr + state.io_cq_tail as u64 * 16) as *mut NvmeCompletion,
                        cqe,
                    )
                };
                state.io_cq_tail = (state.io_cq_tail + 1) % state.io_depth;
                if state.io_cq_tail == 0 {
                    state.io_phase = !state.io_phase;
                }
            }
        }
    }

    impl MmioSpace for FakeNvme {
        fn read32(&self, offset: u64) -> u32 {
            let state = self.state.lock();
            match offset {
                offsets::CAP => 63,         // MQES=63
                0x04 => 0,                  // CAP上位: DSTRD=0, TO=0
                offsets::VS => 0x0001_0400, // 1.4
                offsets::CC => state.cc,
                offsets::CSTS => {
                    if state.cc & CcFlags::EN.bits() != 0 {
                        CstsFlags::RDY.bits()
                    } else {
                        0
                    }
                }
                _ => 0,
            }
        }

        fn write32(&self, offset: u64, value: u32) {
            let mut state = self.state.lock();
            match offset {
                offsets::CC => {
                    state.cc = value;
                    // 無効化遷移で内部キューポインタは初期状態へ戻る
                    if value & CcFlags::EN.bits() == 0 {
                        state.admin_head = 0;
                        state.admin_phase = true;
                        state.io_head = 0;
                        state.io_cq_tail = 0;
                        state.io_phase = true;
                    }
                }
                offsets::ASQ => state.asq[0] = value,
                o if o == offsets::ASQ + 4 => state.asq[1] = value,
                offsets::ACQ => state.acq[0] = value,
                o if o == offsets::ACQ + 4 => state.acq[1] = value,
                // SQ0ドアベル
                o if o == offsets::SQ0TDBL => {
                    self.process_admin(&mut state, value as u16);
                }
                // SQ1ドアベル (stride=4)
                o if o == offsets::SQ0TDBL + 8 => {
                    self.process_io(&mut state, value as u16);
                }
                _ => {}
            }
        }
    }

    fn make_controller() -> (Arc<FakeNvme>, NvmeController<FakeNvme>, TestClock) {
        let fake = Arc::new(FakeNvme::new());
        let mut ctrl = NvmeController::new(Arc::clone(&fake), 8).unwrap();
        let clock = TestClock { now: AtomicU64::new(0) };
        ctrl.init(&clock).expect("controller init succeeds");
        (fake, ctrl, clock)
    }

    #[test]
    fn test_init_handshake() {
        let (fake, ctrl, _clock) = make_controller();
        // 初期化完了後、I/Oキューの所在がデバイスに伝わっている
        let state = fake.state.lock();
        assert_eq!(state.io_sq_addr, ctrl.io.sq_addr());
        assert_eq!(state.io_cq_addr, ctrl.io.cq_addr());
        assert_eq!(state.io_depth, 8);
    }

    #[test]
    fn test_io_read_roundtrip() {
        let (_fake, mut ctrl, _clock) = make_controller();

        let mut buf = IdentityBuffer::new(4096).unwrap();
        let slot = SlotId(3);
        ctrl.issue(slot, &BlockCommand::read(16, 4), Some(&mut buf))
            .unwrap();

        let (done, result) = ctrl.poll_completion().expect("completion arrives");
        assert_eq!(done, slot);
        assert_eq!(result.unwrap().bytes_transferred, 4 * 512);
        assert!(ctrl.poll_completion().is_none());
    }

    #[test]
    fn test_io_error_decoded() {
        let (fake, mut ctrl, _clock) = make_controller();
        // SC=0x02 + DNR
        fake.set_io_status((1 << 14) | 0x02);

        let mut buf = IdentityBuffer::new(512).unwrap();
        ctrl.issue(SlotId(0), &BlockCommand::read(0, 1), Some(&mut buf))
            .unwrap();

        let (_, result) = ctrl.poll_completion().unwrap();
        assert_eq!(
            result,
            Err(ErrorKind::CommandError { code: 0x02, do_not_retry: true })
        );
    }

    #[test]
    fn test_reset_sequence_recreates_queues() {
        let (fake, mut ctrl, clock) = make_controller();

        ctrl.halt(&clock).unwrap();
        ctrl.clear_faults();
        ctrl.link_reset(&clock).unwrap();
        ctrl.verify_device().unwrap();
        ctrl.rearm().unwrap();
        ctrl.restart(&clock).unwrap();

        // リセット後もI/Oが通る
        let mut buf = IdentityBuffer::new(512).unwrap();
        ctrl.issue(SlotId(0), &BlockCommand::write(0, 1), Some(&mut buf))
            .unwrap();
        let (_, result) = ctrl.poll_completion().unwrap();
        assert!(result.is_ok());

        let state = fake.state.lock();
        assert_eq!(state.io_depth, 8);
    }
}
