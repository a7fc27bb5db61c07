// ============================================================================
// src/nvme/queue.rs - NVMe Queue Pair
// ============================================================================
//!
//! # NVMeキューペア
//!
//! 汎用リング ([`SubmissionRing`]/[`CompletionRing`]) をNVMeの
//! SQE/CQEとドアベルレジスタに結びつける。送信はSQへの書き込み +
//! SQテールドアベル、完了消費はフェーズビット判定 + CQヘッドドアベル。
//! CQEの `sq_head` をSQへ還流させることでSQの空き計算が進む。

use alloc::sync::Arc;

use crate::mmio::MmioSpace;
use crate::ring::{CompletionRing, SubmissionRing};

use super::cmd::{NvmeCommand, NvmeCompletion};
use super::regs::offsets;

/// NVMe Queue Pair (SQ + CQ)
pub struct NvmeQueuePair<M: MmioSpace> {
    mmio: Arc<M>,
    qid: u16,
    sq: SubmissionRing<NvmeCommand>,
    cq: CompletionRing<NvmeCompletion>,
    /// SQテールドアベルのオフセット
    sq_doorbell: u64,
    /// CQヘッドドアベルのオフセット
    cq_doorbell: u64,
}

impl<M: MmioSpace> NvmeQueuePair<M> {
    /// 新しいキューペアを割り当てる
    ///
    /// ドアベルオフセット: SQ y = base + (2y) * stride、
    /// CQ y = base + (2y+1) * stride。
    pub fn new(mmio: Arc<M>, qid: u16, depth: u16, doorbell_stride: u64) -> Option<Self> {
        let sq = SubmissionRing::new(depth)?;
        let cq = CompletionRing::new(depth)?;
        let sq_doorbell = offsets::SQ0TDBL + (2 * qid as u64) * doorbell_stride;
        let cq_doorbell = offsets::SQ0TDBL + (2 * qid as u64 + 1) * doorbell_stride;
        Some(Self {
            mmio,
            qid,
            sq,
            cq,
            sq_doorbell,
            cq_doorbell,
        })
    }

    pub fn qid(&self) -> u16 {
        self.qid
    }

    pub fn depth(&self) -> u16 {
        self.sq.depth()
    }

    /// SQのデバイス可視ベースアドレス
    pub fn sq_addr(&self) -> u64 {
        self.sq.device_addr()
    }

    /// CQのデバイス可視ベースアドレス
    pub fn cq_addr(&self) -> u64 {
        self.cq.device_addr()
    }

    /// SQの空きスロット数
    pub fn available(&self) -> u16 {
        self.sq.available()
    }

    /// コマンドをSQへ書き込みドアベルを鳴らす
    ///
    /// 戻り値は書き込んだリングインデックス。フルなら `None`。
    pub fn submit(&self, cmd: &NvmeCommand) -> Option<u16> {
        let idx = self.sq.push(cmd)?;
        self.mmio.write32(self.sq_doorbell, self.sq.tail() as u32);
        Some(idx)
    }

    /// 完了エントリを1件消費する
    ///
    /// 消費時にSQヘッドを還流し、CQヘッドドアベルを更新する。
    pub fn consume(&self) -> Option<NvmeCompletion> {
        let entry = self.cq.consume()?;
        self.sq.update_head(entry.sq_head);
        self.mmio.write32(self.cq_doorbell, self.cq.head() as u32);
        Some(entry)
    }

    /// 両リングを初期状態へ戻す（リセット用、再割り当てなし）
    pub fn reinit(&self) {
        self.sq.reinit();
        self.cq.reinit();
    }

    /// CQメモリへの生ポインタ（テストのデバイスエミュレーション用）
    pub fn cq_ptr(&self) -> *mut NvmeCompletion {
        self.cq.as_ptr()
    }
}

// ============================================================================
// Tests
// ============================================================================
