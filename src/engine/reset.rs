// ============================================================================
// src/engine/reset.rs - Controller Reset Sequence
// ============================================================================
//!
//! # リセット手順
//!
//! 閾値監視が発火したときに実行される回復手順。逐次実行であり、
//! 新規コマンドに割り込まれない（エンジンロック保持下で呼ばれる）:
//!
//! 1. コントローラ/ポートを停止（停止確認は期限付き、失敗は致命的）
//! 2. ペンディングのエラー/ステータスビットをすべてクリア
//! 3. トランスポート固有のリンクレベルリセット（COMRESET / CC.EN遷移）
//! 4. デバイス識別/シグネチャの再確認
//! 5. リングを元のアドレスで再装填し、コントローラを再始動
//!
//! どのステップの失敗もエラーとして返り、エンジンがデバイスを
//! `Unusable` へ遷移させる。カウンタのゼロ戻し（ステップ6）は
//! 成功経路でエンジン側が行う。

use crate::error::ErrorKind;
use crate::time::MonotonicClock;
use crate::transport::QueueTransport;

/// リセット手順を最初から最後まで実行する
pub fn run<T: QueueTransport + ?Sized>(
    transport: &mut T,
    clock: &dyn MonotonicClock,
) -> Result<(), ErrorKind> {
    log::warn!("starting controller reset sequence");

    transport.halt(clock).inspect_err(|e| {
        log::error!("reset step 1 (halt) failed: {}", e);
    })?;

    transport.clear_faults();

    transport.link_reset(clock).inspect_err(|e| {
        log::error!("reset step 3 (link reset) failed: {}", e);
    })?;

    transport.verify_device().inspect_err(|e| {
        log::error!("reset step 4 (device verify) failed: {}", e);
    })?;

    transport.rearm().inspect_err(|e| {
        log::error!("reset step 5 (ring rearm) failed: {}", e);
    })?;

    transport.restart(clock).inspect_err(|e| {
        log::error!("reset step 5 (restart) failed: {}", e);
    })?;

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
