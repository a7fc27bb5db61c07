// ============================================================================
// src/transport.rs - Hardware Transport Contract
// ============================================================================
//!
//! # トランスポート契約
//!
//! コマンドキューエンジンがハードウェアに要求する操作の全体。AHCIポートと
//! NVMe I/Oキューペアがそれぞれ実装し、エンジン側はこのトレイト越しにしか
//! ハードウェアへ触れない。テストはスクリプト可能なモックで置き換える。
//!
//! リセット手順 (§ halt → clear_faults → link_reset → verify_device →
//! rearm → restart) は分割されたオペレーションとして公開され、順序制御と
//! 失敗時の Unusable 遷移はエンジン側のリセット状態機械が受け持つ。

use crate::dma::DmaBuffer;
use crate::error::ErrorKind;
use crate::ring::SlotId;
use crate::time::MonotonicClock;

// ============================================================================
// Block Commands
// ============================================================================

/// ブロック操作種別
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOp {
    /// デバイスから読み取り
    Read,
    /// デバイスへ書き込み
    Write,
    /// 書き込みキャッシュのフラッシュ
    Flush,
    /// ブロック範囲の破棄（TRIM / Deallocate）
    Trim,
}

impl BlockOp {
    /// データ転送を伴う操作か
    pub fn has_data(&self) -> bool {
        matches!(self, BlockOp::Read | BlockOp::Write)
    }
}

/// デバイス非依存のブロックコマンド
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockCommand {
    /// 操作種別
    pub op: BlockOp,
    /// 先頭論理ブロックアドレス
    pub lba: u64,
    /// ブロック数
    pub count: u32,
}

impl BlockCommand {
    pub fn read(lba: u64, count: u32) -> Self {
        Self { op: BlockOp::Read, lba, count }
    }

    pub fn write(lba: u64, count: u32) -> Self {
        Self { op: BlockOp::Write, lba, count }
    }

    pub fn flush() -> Self {
        Self { op: BlockOp::Flush, lba: 0, count: 0 }
    }

    pub fn trim(lba: u64, count: u32) -> Self {
        Self { op: BlockOp::Trim, lba, count }
    }
}

/// コマンド完了時の結果ペイロード
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandResult {
    /// 転送バイト数
    pub bytes_transferred: u32,
}

// ============================================================================
// QueueTransport
// ============================================================================

/// エンジンが消費するハードウェア操作
pub trait QueueTransport: Send {
    /// サブミッションリングのスロット数
    fn slot_count(&self) -> u8;

    /// ハードウェアが busy として報告しているスロットのビットマップ
    ///
    /// スロット空き判定はソフトウェア発行ビットマップとの和集合で行う。
    /// ハードウェア側表示を持たないトランスポート（NVMe）は0を返す。
    fn hw_active_mask(&self) -> u32;

    /// コマンドディスクリプタをスロットへ書き込み、ドアベルを鳴らす
    ///
    /// バッファはコマンド実行中のみ借用される。この呼び出しは同一リングを
    /// 触る他の発行者とエンジンロックで排他されている前提。
    fn issue(
        &mut self,
        slot: SlotId,
        cmd: &BlockCommand,
        buf: Option<&mut (dyn DmaBuffer + '_)>,
    ) -> Result<(), ErrorKind>;

    /// 完了エントリを最大1件回収する
    ///
    /// 完了は発行順と無関係に届く。戻り値のスロットIDでエンジン側が
    /// 待機中のコマンドへ照合する。
    fn poll_completion(&mut self) -> Option<(SlotId, Result<CommandResult, ErrorKind>)>;

    /// 生のエラー/ステータスレジスタから致命的状態を検出する
    ///
    /// 完了待機ループが毎周期呼ぶ。インターフェース致命エラーや
    /// タスクファイルエラーを即座に `Failed` へ変換するため。
    fn probe_fault(&mut self) -> Option<ErrorKind>;

    /// ペンディングのエラー/ステータスビットをクリアする
    ///
    /// リトライ前に呼ばないと、過去のエラービットが次の発行を
    /// 即座に再拒否する。
    fn clear_faults(&mut self);

    // ------------------------------------------------------------------
    // リセット手順（エンジンのリセット状態機械から順に呼ばれる）
    // ------------------------------------------------------------------

    /// (1) コントローラ/ポートを停止し、停止完了を期限付きで確認する
    ///
    /// ここでの失敗は致命的であり、リトライされない。
    fn halt(&mut self, clock: &dyn MonotonicClock) -> Result<(), ErrorKind>;

    /// (3) トランスポート固有のリンクレベルリセット
    ///
    /// SATA なら COMRESET、NVMe ならコントローラの disable→enable。
    fn link_reset(&mut self, clock: &dyn MonotonicClock) -> Result<(), ErrorKind>;

    /// (4) デバイスの識別/シグネチャを再確認する
    fn verify_device(&mut self) -> Result<(), ErrorKind>;

    /// (5a) サブミッション/コンプリーションリングを元のアドレスで再装填する
    fn rearm(&mut self) -> Result<(), ErrorKind>;

    /// (5b) コントローラ/ポートを再始動する
    fn restart(&mut self, clock: &dyn MonotonicClock) -> Result<(), ErrorKind>;
}
