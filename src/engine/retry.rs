// ============================================================================
// src/engine/retry.rs - Per-ErrorKind Retry Policy
// ============================================================================
//!
//! # リトライポリシー
//!
//! 参照実装は回復可能なエラーをすべて同一に扱い、デバイスに能動的に
//! 拒否されたコマンドもトランスポートのタイムアウトと同じ予算を消費
//! していた。ここではその選択をポリシーとして明示する:
//!
//! - `default()`: デバイスの再試行禁止ヒント（NVMe DNR等）と致命的
//!   インターフェースエラーは残り予算を捨てて即座にエスカレーションする
//! - `uniform()`: 全エラー分類を同一に扱う（参照実装互換）

use crate::error::ErrorKind;

/// ErrorKindごとのリトライ判断
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// デバイスの再試行禁止ヒントを尊重する
    pub honor_do_not_retry: bool,
    /// 致命的インターフェースエラーで残り予算を捨てる
    pub fail_fast_on_fatal: bool,
}

impl RetryPolicy {
    /// 全分類を同一に扱う（ブラインドリトライ）
    pub const fn uniform() -> Self {
        Self {
            honor_do_not_retry: false,
            fail_fast_on_fatal: false,
        }
    }

    /// このエラーで残りのリトライ予算を捨てるべきか
    ///
    /// true でも失敗は既に閾値監視へ記録済みであることに注意。
    /// ポリシーが決めるのは「同じコマンドをもう一度投げるか」だけ。
    pub fn short_circuits(&self, kind: ErrorKind) -> bool {
        match kind {
            ErrorKind::Fatal => self.fail_fast_on_fatal,
            ErrorKind::CommandError { do_not_retry, .. } => {
                do_not_retry && self.honor_do_not_retry
            }
            ErrorKind::Timeout | ErrorKind::InterfaceError => false,
            // 終端分類はリトライ層まで到達しない
            ErrorKind::ResetFailed | ErrorKind::DeviceUnusable => true,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            honor_do_not_retry: true,
            fail_fast_on_fatal: true,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
