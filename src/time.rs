// ============================================================================
// src/time.rs - Monotonic Clock and Deadlines
// ============================================================================
//!
//! # 時間管理
//!
//! カーネルの `SystemClock::uptime_nanos()` に相当する単調クロックを
//! トレイトとして注入可能にしたもの。完了待機ループの期限計算と
//! リトライ間のバックオフはすべてこのクロックに対して行うため、
//! 同じ状態機械がスピンCPU・スケジューラ・テスト用モッククロックの
//! いずれの上でも動く。

/// ナノ秒単位の時間
pub type Nanoseconds = u64;

/// 1秒のナノ秒数
pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// 1ミリ秒のナノ秒数
pub const NANOS_PER_MILLI: u64 = 1_000_000;

/// 1マイクロ秒のナノ秒数
pub const NANOS_PER_MICRO: u64 = 1_000;

/// コマンド1件の完了待機期限（操作クラス単位の単一定数）
pub const COMMAND_TIMEOUT_NANOS: Nanoseconds = 30 * NANOS_PER_SEC;

/// リトライ間の固定バックオフ
pub const RETRY_BACKOFF_NANOS: Nanoseconds = 10 * NANOS_PER_MILLI;

/// コントローラ/ポート停止の確認期限（超過はリセット失敗として致命的）
pub const HALT_TIMEOUT_NANOS: Nanoseconds = 500 * NANOS_PER_MILLI;

/// リンクリセット後のデバイス存在確認期限
pub const LINK_RESET_TIMEOUT_NANOS: Nanoseconds = NANOS_PER_SEC;

/// コントローラ再始動後のレディ確認期限
pub const READY_TIMEOUT_NANOS: Nanoseconds = 2 * NANOS_PER_SEC;

// ============================================================================
// MonotonicClock
// ============================================================================

/// 単調クロック
pub trait MonotonicClock: Send + Sync {
    /// 起動からの経過ナノ秒
    fn uptime_nanos(&self) -> Nanoseconds;

    /// 指定時間だけ待つ
    ///
    /// 既定実装はクロックに対するビジーウェイト。スケジューラを持つ
    /// ホストは yield する実装で置き換える。
    fn sleep_nanos(&self, nanos: Nanoseconds) {
        let until = self.uptime_nanos().saturating_add(nanos);
        while self.uptime_nanos() < until {
            core::hint::spin_loop();
        }
    }
}

// ============================================================================
// Deadline
// ============================================================================

/// ポーリングループの期限
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    expires_at: Nanoseconds,
}

impl Deadline {
    /// 現在時刻 + タイムアウトで期限を作成
    pub fn after(clock: &dyn MonotonicClock, timeout: Nanoseconds) -> Self {
        Self {
            expires_at: clock.uptime_nanos().saturating_add(timeout),
        }
    }

    /// 期限を過ぎたかどうか
    pub fn expired(&self, clock: &dyn MonotonicClock) -> bool {
        clock.uptime_nanos() >= self.expires_at
    }

    /// 期限までの残りナノ秒（過ぎていれば0）
    pub fn remaining(&self, clock: &dyn MonotonicClock) -> Nanoseconds {
        self.expires_at.saturating_sub(clock.uptime_nanos())
    }
}

// ============================================================================
// Tests
// ============================================================================
