// ============================================================================
// src/lib.rs - exoblk: Command-Ring Storage Engine
// ============================================================================
//!
//! # exoblk
//!
//! AHCI/NVMeストレージコントローラが共有するコマンドキュープロトコルを
//! 切り出した再利用可能なドライバコア。
//!
//! ## アーキテクチャ
//! - コマンドリング（サブミッション/コンプリーション + フェーズビット）
//! - スロットアロケータ（ソフトウェア発行ビットマップ ∪ ハードウェア側アクティブ表示）
//! - 完了待機（モノトニッククロックに基づく期限付きポーリング）
//! - リトライ制御（ErrorKindごとの明示的ポリシー）
//! - エラー閾値監視とリセット状態機械（Normal → Degraded → Resetting → Normal|Unusable）
//! - ブロックリクエストフロントエンド（read/write/flush/trim + リクエストキュー）
//!
//! ## 同期モデル
//! デバイスごとに1つのエンジンロックがスロット割り当て・発行・完了回収を
//! 直列化する。完了はコマンドIDで照合するため、複数コマンドの
//! アウトオブオーダー完了を許容する。

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod ahci;
pub mod block;
pub mod dma;
pub mod engine;
pub mod error;
pub mod mmio;
pub mod nvme;
pub mod ring;
pub mod time;
pub mod transport;

#[allow(unused_imports)]
pub use block::{
    BlockDevice, BlockDeviceInfo, BlockRequest, DeviceHandle, DeviceRegistry,
    QueueBlockDevice, RequestQueue, RequestState, StatsSnapshot,
};
#[allow(unused_imports)]
pub use engine::{
    CommandEngine, CommandStatus, EngineConfig, EngineHealth, FaultMonitor,
    FaultVerdict, RetryPolicy,
};
#[allow(unused_imports)]
pub use error::{ErrorKind, IoError, IoResult};
#[allow(unused_imports)]
pub use ring::{CompletionEntry, CompletionRing, SlotId, SlotTable, SubmissionRing};
#[allow(unused_imports)]
pub use transport::{BlockCommand, BlockOp, CommandResult, QueueTransport};
