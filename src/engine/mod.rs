// ============================================================================
// src/engine/mod.rs - Command Queue Engine
// ============================================================================
//!
//! # コマンドキューエンジン
//!
//! サブミット → 完了待機 → リトライ → 閾値超過でリセット、という
//! ストレージコントローラ共通のプロトコルを [`QueueTransport`] の上で
//! 駆動する。
//!
//! ## ロック規律
//! エンジンロックはスロット割り当て・発行・完了回収を直列化する。
//! 待機ループはロックを保持したまま眠らない。毎周期短くロックを取り、
//! 完了を回収しては手放す。これにより同一デバイスに対する複数の
//! 未完了コマンド（コマンドIDで照合）が成立する。
//!
//! ## バッファ所有権
//! DMAバッファは1コマンドの間だけ借用し、完了・失敗・タイムアウトの
//! いずれかを消費した後は参照を保持しない。

mod fault;
mod reset;
mod retry;

pub use fault::{FaultMonitor, FaultVerdict};
pub use retry::RetryPolicy;

use core::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use hashbrown::HashMap;
use spin::Mutex;

use crate::dma::DmaBuffer;
use crate::error::{ErrorKind, IoError, IoResult};
use crate::ring::{SlotId, SlotTable};
use crate::time::{
    Deadline, MonotonicClock, Nanoseconds, COMMAND_TIMEOUT_NANOS, RETRY_BACKOFF_NANOS,
};
use crate::transport::{BlockCommand, CommandResult, QueueTransport};

// ============================================================================
// Configuration
// ============================================================================

/// エンジン設定
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// コマンドあたりの最大発行回数
    pub max_retries: u32,
    /// 完了待機期限
    pub command_timeout: Nanoseconds,
    /// リトライ間の固定バックオフ
    pub retry_backoff: Nanoseconds,
    /// 連続エラー数がこの値に達したらリセットを発火
    pub fault_threshold: u32,
    /// ErrorKindごとのリトライポリシー
    pub retry_policy: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            command_timeout: COMMAND_TIMEOUT_NANOS,
            retry_backoff: RETRY_BACKOFF_NANOS,
            fault_threshold: 10,
            retry_policy: RetryPolicy::default(),
        }
    }
}

// ============================================================================
// Engine State
// ============================================================================

/// デバイス健全性状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineHealth {
    /// 通常運転
    Normal = 0,
    /// エラーを観測したがリトライで継続中
    Degraded = 1,
    /// リセット状態機械が実行中（新規コマンドは受け付けない）
    Resetting = 2,
    /// 恒久的に使用不能（以後ハードウェアに触れない）
    Unusable = 3,
}

impl EngineHealth {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => EngineHealth::Normal,
            1 => EngineHealth::Degraded,
            2 => EngineHealth::Resetting,
            _ => EngineHealth::Unusable,
        }
    }
}

/// 完了待機の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// 正常完了
    Completed(CommandResult),
    /// デバイスがエラーを報告した
    Failed(ErrorKind),
    /// 期限内に完了しなかった（回復可能: エスカレーションはリトライ層の仕事）
    TimedOut,
}

/// ロック下で保護される可変状態
struct EngineInner<T: QueueTransport> {
    transport: T,
    slots: SlotTable,
    /// 別スロット宛に先着した完了エントリの待避場所（スロットID→結果）
    parked: HashMap<u16, Result<CommandResult, ErrorKind>>,
}

/// コマンドキューエンジン
pub struct CommandEngine<T: QueueTransport, C: MonotonicClock> {
    inner: Mutex<EngineInner<T>>,
    clock: C,
    config: EngineConfig,
    monitor: FaultMonitor,
    health: AtomicU8,
    /// リセット実行回数（観測用）
    resets: AtomicU64,
}

impl<T: QueueTransport, C: MonotonicClock> CommandEngine<T, C> {
    /// 新しいエンジンを作成
    pub fn new(transport: T, clock: C, config: EngineConfig) -> Self {
        let slots = SlotTable::new(transport.slot_count());
        Self {
            inner: Mutex::new(EngineInner {
                transport,
                slots,
                parked: HashMap::new(),
            }),
            clock,
            config,
            monitor: FaultMonitor::new(config.fault_threshold),
            health: AtomicU8::new(EngineHealth::Normal as u8),
            resets: AtomicU64::new(0),
        }
    }

    /// 現在の健全性状態
    pub fn health(&self) -> EngineHealth {
        EngineHealth::from_u8(self.health.load(Ordering::Acquire))
    }

    /// 障害監視（連続エラー数・最終エラーの観測用）
    pub fn monitor(&self) -> &FaultMonitor {
        &self.monitor
    }

    /// これまでに実行したリセット回数
    pub fn reset_count(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }

    fn set_health(&self, health: EngineHealth) {
        self.health.store(health as u8, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Submit
    // ------------------------------------------------------------------

    /// コマンドを発行する
    ///
    /// スロット割り当てと発行はエンジンロック下で行われ、同一リングへの
    /// 二重発行を防ぐ。空きスロットがなければ `RingFull` を同期的に返す
    /// （ブロックしない。キューイングはフロントエンドの責務）。
    pub fn submit(
        &self,
        cmd: &BlockCommand,
        buf: Option<&mut (dyn DmaBuffer + '_)>,
    ) -> IoResult<SlotId> {
        if self.health() == EngineHealth::Unusable {
            return Err(IoError::Device(ErrorKind::DeviceUnusable));
        }

        let mut inner = self.inner.lock();
        let hw_active = inner.transport.hw_active_mask();
        let slot = inner
            .slots
            .allocate(hw_active)
            .ok_or(IoError::RingFull)?;

        match inner.transport.issue(slot, cmd, buf) {
            Ok(()) => Ok(slot),
            Err(kind) => {
                inner.slots.release(slot);
                Err(IoError::Device(kind))
            }
        }
    }

    // ------------------------------------------------------------------
    // Completion Waiter
    // ------------------------------------------------------------------

    /// 指定スロットの完了を期限付きで待つ
    ///
    /// 毎周期: 待避済み完了 → 新規完了の回収 → 生レジスタの致命状態 →
    /// 期限、の順に確認する。完了はコマンドIDで照合するため発行順と
    /// 無関係に届いてよい。戻る時点でスロットはアロケータへ返却済み。
    pub fn wait(&self, slot: SlotId, timeout: Nanoseconds) -> CommandStatus {
        let deadline = Deadline::after(&self.clock, timeout);

        loop {
            {
                let mut inner = self.inner.lock();

                // 先に別の待機者が回収してくれた完了
                if let Some(result) = inner.parked.remove(&slot.as_u16()) {
                    inner.slots.release(slot);
                    return Self::status_from(result);
                }

                // 新規完了を回収。他スロット宛は待避しておく
                while let Some((done, result)) = inner.transport.poll_completion() {
                    if done == slot {
                        inner.slots.release(slot);
                        return Self::status_from(result);
                    }
                    // 既に手放されたスロットの遅延完了は捨てる
                    if inner.slots.issued_mask() & done.mask() != 0 {
                        inner.parked.insert(done.as_u16(), result);
                    }
                }

                // 完了前に生レジスタが致命的状態を示したら即 Failed
                if let Some(fault) = inner.transport.probe_fault() {
                    inner.parked.remove(&slot.as_u16());
                    inner.slots.release(slot);
                    return CommandStatus::Failed(fault);
                }
            }

            if deadline.expired(&self.clock) {
                let mut inner = self.inner.lock();
                inner.parked.remove(&slot.as_u16());
                inner.slots.release(slot);
                return CommandStatus::TimedOut;
            }

            #[cfg(feature = "verbose_logging")]
            log::trace!("slot {} pending, {}ns remaining", slot.as_u8(), deadline.remaining(&self.clock));

            core::hint::spin_loop();
        }
    }

    fn status_from(result: Result<CommandResult, ErrorKind>) -> CommandStatus {
        match result {
            Ok(res) => CommandStatus::Completed(res),
            Err(kind) => CommandStatus::Failed(kind),
        }
    }

    // ------------------------------------------------------------------
    // Retry Controller
    // ------------------------------------------------------------------

    /// コマンドをリトライ付きで実行する
    ///
    /// 最大 `max_retries` 回まで 発行→待機 を繰り返す。成功で連続エラー
    /// カウンタをゼロに戻す。失敗のたびに障害監視へ記録し、閾値に達したら
    /// それ以上のリトライの代わりにリセット状態機械を実行する。
    /// `RingFull` はリトライを消費せず即座に呼び出し側へ返る。
    pub fn execute(
        &self,
        cmd: &BlockCommand,
        mut buf: Option<&mut dyn DmaBuffer>,
    ) -> IoResult<CommandResult> {
        if self.health() == EngineHealth::Unusable {
            return Err(IoError::Device(ErrorKind::DeviceUnusable));
        }

        let mut last_error = ErrorKind::Timeout;

        for attempt in 0..self.config.max_retries {
            let borrowed: Option<&mut dyn DmaBuffer> = buf.as_deref_mut();
            let slot = self.submit(cmd, borrowed)?;

            let kind = match self.wait(slot, self.config.command_timeout) {
                CommandStatus::Completed(result) => {
                    self.monitor.record_success();
                    self.set_health(EngineHealth::Normal);
                    return Ok(result);
                }
                CommandStatus::Failed(kind) => kind,
                CommandStatus::TimedOut => ErrorKind::Timeout,
            };

            last_error = kind;
            log::warn!(
                "command {:?} attempt {}/{} failed: {}",
                cmd.op,
                attempt + 1,
                self.config.max_retries,
                kind
            );

            match self.monitor.record_failure(kind) {
                FaultVerdict::ResetTriggered => {
                    // 閾値超過: 以後のリトライの代わりにリセット
                    return match self.run_reset() {
                        Ok(()) => Err(IoError::Device(last_error)),
                        Err(kind) => Err(IoError::Device(kind)),
                    };
                }
                FaultVerdict::RetryBudgetRemains => {
                    self.set_health(EngineHealth::Degraded);
                    if self.config.retry_policy.short_circuits(kind) {
                        // デバイスが再試行禁止を示した等: 残り予算を捨てる
                        break;
                    }
                    // 過去のエラービットが次の発行を再拒否しないようクリア
                    let mut inner = self.inner.lock();
                    inner.transport.clear_faults();
                    drop(inner);
                    self.clock.sleep_nanos(self.config.retry_backoff);
                }
            }
        }

        Err(IoError::Device(last_error))
    }

    // ------------------------------------------------------------------
    // Reset State Machine
    // ------------------------------------------------------------------

    /// リセット状態機械を実行する
    ///
    /// エンジンロックを保持したまま逐次実行するため、新規コマンドに
    /// 割り込まれない。成功でエラーカウンタをゼロに戻し `Normal` へ、
    /// 失敗で `Unusable` へ遷移する（終端状態、以後ハードウェア非接触）。
    fn run_reset(&self) -> Result<(), ErrorKind> {
        self.set_health(EngineHealth::Resetting);
        self.resets.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.lock();
        match reset::run(&mut inner.transport, &self.clock) {
            Ok(()) => {
                inner.slots.clear();
                inner.parked.clear();
                self.monitor.reset_counter();
                self.set_health(EngineHealth::Normal);
                log::info!("controller reset complete, device back in service");
                Ok(())
            }
            Err(step_error) => {
                self.set_health(EngineHealth::Unusable);
                log::error!("controller reset failed ({}), device marked unusable", step_error);
                Err(ErrorKind::DeviceUnusable)
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
