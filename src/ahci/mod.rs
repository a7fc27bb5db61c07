// ============================================================================
// src/ahci/mod.rs - AHCI (SATA) Transport
// ============================================================================
//!
//! # AHCIトランスポート
//!
//! SATAポートをコマンドキューエンジンの [`QueueTransport`] として公開する。
//!
//! ## アーキテクチャ
//! - ポートごとのコマンドリスト（32スロット）とコマンドテーブル
//! - FIS (Frame Information Structure) ベースの通信
//! - スロット空き判定は PxSACT | PxCI（ハードウェア側アクティブ表示）
//! - 回復は COMRESET（SCTL.DET トグル + 存在確認ポーリング）

mod fis;
mod hba;
mod identify;
mod port;
mod regs;

pub use fis::{FisRegH2D, FisType};
pub use hba::AhciHba;
pub use identify::IdentifyData;
pub use port::AhciPort;
pub use regs::{decode_port_error, DeviceSignature, PortCmd, PortIrq, SataError};
