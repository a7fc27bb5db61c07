// ============================================================================
// src/nvme/cmd.rs - NVMe Command Structures
// ============================================================================
//!
//! Submission Queue Entry (SQE) / Completion Queue Entry (CQE) と
//! コマンドビルダ。ステータスフィールドから [`ErrorKind`] への変換は
//! [`decode_status`] に集約する。

use crate::error::ErrorKind;
use crate::ring::CompletionEntry;

/// 管理コマンドオペコード
pub mod admin_opcode {
    pub const CREATE_IO_SQ: u8 = 0x01;
    pub const CREATE_IO_CQ: u8 = 0x05;
    pub const IDENTIFY: u8 = 0x06;
}

/// I/Oコマンドオペコード
pub mod io_opcode {
    pub const FLUSH: u8 = 0x00;
    pub const WRITE: u8 = 0x01;
    pub const READ: u8 = 0x02;
    pub const DATASET_MANAGEMENT: u8 = 0x09;
}

// ============================================================================
// Submission Queue Entry
// ============================================================================

/// NVMe Submission Queue Entry (64バイト)
#[repr(C, align(64))]
#[derive(Clone, Copy, Debug, Default)]
pub struct NvmeCommand {
    /// Command Dword 0 (opcode[7:0], cid[31:16])
    pub cdw0: u32,
    /// Namespace ID
    pub nsid: u32,
    /// Reserved
    pub cdw2: u32,
    pub cdw3: u32,
    /// Metadata Pointer
    pub mptr: u64,
    /// Data Pointer - PRP Entry 1
    pub dptr1: u64,
    /// Data Pointer - PRP Entry 2
    pub dptr2: u64,
    /// Command Dword 10
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

impl NvmeCommand {
    /// オペコードとCIDを指定して新しいコマンドを作成
    pub fn with_opcode_and_cid(opcode: u8, cid: u16) -> Self {
        Self {
            cdw0: (opcode as u32) | ((cid as u32) << 16),
            ..Default::default()
        }
    }

    /// コマンドIDを取得
    pub fn cid(&self) -> u16 {
        (self.cdw0 >> 16) as u16
    }

    /// オペコードを取得
    pub fn opcode(&self) -> u8 {
        (self.cdw0 & 0xFF) as u8
    }

    /// PRPエントリを設定
    pub fn set_prp(&mut self, prp1: u64, prp2: u64) -> &mut Self {
        self.dptr1 = prp1;
        self.dptr2 = prp2;
        self
    }

    // ========================================
    // I/O Commands
    // ========================================

    /// Read コマンドを作成 (NLBは0-based)
    pub fn read(cid: u16, nsid: u32, slba: u64, nlb: u16, prp1: u64, prp2: u64) -> Self {
        let mut cmd = Self::with_opcode_and_cid(io_opcode::READ, cid);
        cmd.nsid = nsid;
        cmd.set_prp(prp1, prp2);
        cmd.cdw10 = slba as u32;
        cmd.cdw11 = (slba >> 32) as u32;
        cmd.cdw12 = nlb as u32;
        cmd
    }

    /// Write コマンドを作成 (NLBは0-based)
    pub fn write(cid: u16, nsid: u32, slba: u64, nlb: u16, prp1: u64, prp2: u64) -> Self {
        let mut cmd = Self::with_opcode_and_cid(io_opcode::WRITE, cid);
        cmd.nsid = nsid;
        cmd.set_prp(prp1, prp2);
        cmd.cdw10 = slba as u32;
        cmd.cdw11 = (slba >> 32) as u32;
        cmd.cdw12 = nlb as u32;
        cmd
    }

    /// Flush コマンドを作成
    pub fn flush(cid: u16, nsid: u32) -> Self {
        let mut cmd = Self::with_opcode_and_cid(io_opcode::FLUSH, cid);
        cmd.nsid = nsid;
        cmd
    }

    /// Dataset Management (Deallocate) コマンドを作成
    pub fn dataset_management(cid: u16, nsid: u32, nr: u8, prp1: u64) -> Self {
        let mut cmd = Self::with_opcode_and_cid(io_opcode::DATASET_MANAGEMENT, cid);
        cmd.nsid = nsid;
        cmd.set_prp(prp1, 0);
        cmd.cdw10 = nr as u32; // Number of Ranges (0-based)
        cmd.cdw11 = 0x04; // AD=1: Attribute Deallocate
        cmd
    }

    // ========================================
    // Admin Commands
    // ========================================

    /// Identify Namespace コマンドを作成
    pub fn identify_namespace(cid: u16, nsid: u32, prp1: u64) -> Self {
        let mut cmd = Self::with_opcode_and_cid(admin_opcode::IDENTIFY, cid);
        cmd.nsid = nsid;
        cmd.cdw10 = 0x00; // CNS = 00h: Identify Namespace
        cmd.set_prp(prp1, 0);
        cmd
    }

    /// Create I/O Completion Queue コマンドを作成
    pub fn create_io_cq(cid: u16, qid: u16, queue_size: u16, prp: u64) -> Self {
        let mut cmd = Self::with_opcode_and_cid(admin_opcode::CREATE_IO_CQ, cid);
        cmd.set_prp(prp, 0);
        // CDW10: Queue Size 0-based (15:0) | Queue Identifier (31:16)
        cmd.cdw10 = ((qid as u32) << 16) | ((queue_size - 1) as u32);
        // CDW11: PC=1 (Physically Contiguous)、割り込みなし（ポーリング運用）
        cmd.cdw11 = 0x01;
        cmd
    }

    /// Create I/O Submission Queue コマンドを作成
    pub fn create_io_sq(cid: u16, qid: u16, queue_size: u16, prp: u64, cqid: u16) -> Self {
        let mut cmd = Self::with_opcode_and_cid(admin_opcode::CREATE_IO_SQ, cid);
        cmd.set_prp(prp, 0);
        cmd.cdw10 = ((qid as u32) << 16) | ((queue_size - 1) as u32);
        // CDW11: CQID (31:16) | PC=1
        cmd.cdw11 = ((cqid as u32) << 16) | 0x01;
        cmd
    }
}

// ============================================================================
// Completion Queue Entry
// ============================================================================

/// NVMe Completion Queue Entry (16バイト)
#[repr(C, align(16))]
#[derive(Clone, Copy, Debug, Default)]
pub struct NvmeCompletion {
    /// Command Specific (DW0)
    pub result: u32,
    /// Reserved (DW1)
    pub rsvd: u32,
    /// SQ Head Pointer
    pub sq_head: u16,
    /// SQ Identifier
    pub sq_id: u16,
    /// Command Identifier
    pub cid: u16,
    /// Status Field (P | SC | SCT | CRD | M | DNR)
    pub status: u16,
}

impl NvmeCompletion {
    /// Status Code Type (SCT)
    pub fn sct(&self) -> u8 {
        ((self.status >> 9) & 0x7) as u8
    }

    /// Status Code (SC)
    pub fn sc(&self) -> u8 {
        ((self.status >> 1) & 0xFF) as u8
    }

    /// DNR (Do Not Retry) ビット
    pub fn dnr(&self) -> bool {
        (self.status >> 15) & 1 != 0
    }

    /// 成功かどうか
    pub fn is_success(&self) -> bool {
        self.sct() == 0 && self.sc() == 0
    }
}

impl CompletionEntry for NvmeCompletion {
    fn phase(&self) -> bool {
        self.status & 1 != 0
    }

    fn command_id(&self) -> u16 {
        self.cid
    }
}

// ============================================================================
// Status Decode
// ============================================================================

/// CQEステータスフィールドを [`ErrorKind`] へ変換する
///
/// SCT/SC/DNRのビットレイアウトを知ってよいのはこの関数だけ。
pub fn decode_status(completion: &NvmeCompletion) -> Result<(), ErrorKind> {
    if completion.is_success() {
        return Ok(());
    }

    let sct = completion.sct();
    let sc = completion.sc();
    let code = ((sct as u16) << 8) | sc as u16;

    match sct {
        // Path Related Status: 経路の一時障害として扱う
        0x3 if !completion.dnr() => Err(ErrorKind::InterfaceError),
        // Generic / Command Specific / Media: デバイスによる拒否
        _ => Err(ErrorKind::CommandError {
            code,
            do_not_retry: completion.dnr(),
        }),
    }
}

// ============================================================================
// Dataset Management Range
// ============================================================================

/// Dataset Management Range Entry (16バイト)
#[repr(C, align(16))]
#[derive(Clone, Copy, Debug, Default)]
pub struct DsmRange {
    /// Context Attributes
    pub cattr: u32,
    /// Length in logical blocks
    pub nlb: u32,
    /// Starting LBA
    pub slba: u64,
}

impl DsmRange {
    pub fn new(slba: u64, nlb: u32) -> Self {
        Self { cattr: 0, nlb, slba }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_sizes() {
        assert_eq!(core::mem::size_of::<NvmeCommand>(), 64);
        assert_eq!(core::mem::size_of::<NvmeCompletion>(), 16);
        assert_eq!(core::mem::size_of::<DsmRange>(), 16);
    }

    #[test]
    fn test_read_command_layout() {
        let cmd = NvmeCommand::read(7, 1, 0x1_0000_0010, 15, 0x2000, 0);
        assert_eq!(cmd.opcode(), io_opcode::READ);
        assert_eq!(cmd.cid(), 7);
        assert_eq!(cmd.nsid, 1);
        assert_eq!(cmd.cdw10, 0x0000_0010);
        assert_eq!(cmd.cdw11, 0x1);
        assert_eq!(cmd.cdw12, 15);
        assert_eq!(cmd.dptr1, 0x2000);
    }

    #[test]
    fn test_decode_success() {
        let cqe = NvmeCompletion { status: 1, ..Default::default() }; // phase=1, SC=0
        assert!(decode_status(&cqe).is_ok());
    }

    #[test]
    fn test_decode_command_error_with_dnr() {
        // SC=0x02 (Invalid Field), DNR=1
        let cqe = NvmeCompletion {
            status: (1 << 15) | (0x02 << 1),
            ..Default::default()
        };
        assert_eq!(
            decode_status(&cqe),
            Err(ErrorKind::CommandError { code: 0x02, do_not_retry: true })
        );
    }

    #[test]
    fn test_decode_path_error_is_transient() {
        // SCT=3, SC=0x71, DNR=0
        let cqe = NvmeCompletion {
            status: (0x3 << 9) | (0x71 << 1),
            ..Default::default()
        };
        assert_eq!(decode_status(&cqe), Err(ErrorKind::InterfaceError));
    }

    #[test]
    fn test_create_io_sq_links_cq() {
        let cmd = NvmeCommand::create_io_sq(1, 1, 64, 0x4000, 1);
        assert_eq!(cmd.cdw10, (1 << 16) | 63);
        assert_eq!(cmd.cdw11, (1 << 16) | 1);
    }
}
