// ============================================================================
// src/engine/fault.rs - Error-Threshold Monitor
// ============================================================================
//!
//! # エラー閾値監視
//!
//! デバイス/ポートごとの連続エラーカウンタ。成功のたびにゼロへ戻り、
//! 失敗のたびに加算され、加算直後に閾値と比較される。閾値到達は
//! 「以後のリトライの代わりにリセット」の合図であり、判断だけを返す。
//! リセットの実行自体はエンジンの責務。
//!
//! このカウンタはリセットを跨いで生存する唯一の状態（リセット成功時に
//! 明示的にゼロへ戻される）。

use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use crate::error::ErrorKind;

/// 失敗記録に対する判定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultVerdict {
    /// まだ閾値未満: リトライ予算の範囲で継続してよい
    RetryBudgetRemains,
    /// 閾値到達: リセット状態機械を実行すべき
    ResetTriggered,
}

/// 障害監視
pub struct FaultMonitor {
    /// 連続エラー数
    consecutive_errors: AtomicU32,
    /// 最後に観測したエラー
    last_error: Mutex<Option<ErrorKind>>,
    /// リセット発火閾値
    threshold: u32,
}

impl FaultMonitor {
    /// 指定閾値で監視を作成
    pub fn new(threshold: u32) -> Self {
        assert!(threshold >= 1);
        Self {
            consecutive_errors: AtomicU32::new(0),
            last_error: Mutex::new(None),
            threshold,
        }
    }

    /// リセット発火閾値
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// 現在の連続エラー数
    pub fn error_count(&self) -> u32 {
        self.consecutive_errors.load(Ordering::Acquire)
    }

    /// 最後に観測したエラー
    pub fn last_error(&self) -> Option<ErrorKind> {
        *self.last_error.lock()
    }

    /// 成功を記録する: 連続エラーカウンタは無条件でゼロへ戻る
    pub fn record_success(&self) {
        self.consecutive_errors.store(0, Ordering::Release);
    }

    /// 失敗を記録し、リトライ継続かリセットかを判定する
    pub fn record_failure(&self, error: ErrorKind) -> FaultVerdict {
        *self.last_error.lock() = Some(error);
        let count = self.consecutive_errors.fetch_add(1, Ordering::AcqRel) + 1;

        if count >= self.threshold {
            log::warn!(
                "consecutive error threshold reached ({}/{}), escalating to reset",
                count,
                self.threshold
            );
            FaultVerdict::ResetTriggered
        } else {
            FaultVerdict::RetryBudgetRemains
        }
    }

    /// カウンタをゼロへ戻す（リセット状態機械の最終ステップ）
    pub fn reset_counter(&self) {
        self.consecutive_errors.store(0, Ordering::Release);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_fires_on_nth_failure() {
        let monitor = FaultMonitor::new(3);
        assert_eq!(
            monitor.record_failure(ErrorKind::Timeout),
            FaultVerdict::RetryBudgetRemains
        );
        assert_eq!(
            monitor.record_failure(ErrorKind::Timeout),
            FaultVerdict::RetryBudgetRemains
        );
        // 3回目で発火
        assert_eq!(
            monitor.record_failure(ErrorKind::Timeout),
            FaultVerdict::ResetTriggered
        );
    }

    #[test]
    fn test_success_resets_counter() {
        let monitor = FaultMonitor::new(3);
        monitor.record_failure(ErrorKind::Timeout);
        monitor.record_failure(ErrorKind::InterfaceError);
        assert_eq!(monitor.error_count(), 2);

        // threshold-1 での成功がリセット発火を完全に防ぐ
        monitor.record_success();
        assert_eq!(monitor.error_count(), 0);
        assert_eq!(
            monitor.record_failure(ErrorKind::Timeout),
            FaultVerdict::RetryBudgetRemains
        );
    }

    #[test]
    fn test_last_error_tracked() {
        let monitor = FaultMonitor::new(5);
        assert!(monitor.last_error().is_none());
        monitor.record_failure(ErrorKind::Fatal);
        assert_eq!(monitor.last_error(), Some(ErrorKind::Fatal));
        // 成功してもlast_errorは観測用に残る
        monitor.record_success();
        assert_eq!(monitor.last_error(), Some(ErrorKind::Fatal));
    }
}
