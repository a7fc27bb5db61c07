// ============================================================================
// src/error.rs - Storage Engine Error Types
// ============================================================================
//!
//! # エラー型
//!
//! コマンドキューエンジン全体で使用するエラー分類。
//!
//! 2層構造:
//! - [`ErrorKind`]: トランスポートが完了ステータス/生レジスタから
//!   デコードするデバイスレベルの失敗分類。リトライ層の判断材料。
//! - [`IoError`]: ブロックAPI呼び出し側に見える最終的なエラー。
//!   `RingFull` はデバイス障害ではなくバックプレッシャ信号として区別する。

use core::fmt;

/// ブロック操作の結果型
pub type IoResult<T> = Result<T, IoError>;

// ============================================================================
// ErrorKind - device-level failure taxonomy
// ============================================================================

/// デバイスレベルの失敗分類
///
/// トランスポート固有のビットレイアウトを知るのはデコード関数のみで、
/// エンジン側はこの列挙だけを扱う。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 期限内に完了しなかった（回復可能、リトライを1回消費）
    Timeout,
    /// 一時的なトランスポート障害（回復可能、リトライ前にステータスをクリア）
    InterfaceError,
    /// デバイスがコマンドを拒否した（タスクファイル/コマンドエラー）
    ///
    /// `code` はトランスポート固有の生エラーコード。
    /// `do_not_retry` はデバイス側の再試行禁止ヒント（NVMe DNRビット等）。
    CommandError { code: u16, do_not_retry: bool },
    /// インターフェース致命的エラー（リンクレベル障害）
    Fatal,
    /// リセット手順自体が失敗した（回復不能）
    ResetFailed,
    /// デバイスは恒久的に使用不能（リセット失敗後にキャッシュされる終端状態）
    DeviceUnusable,
}

impl ErrorKind {
    /// リトライで回復しうる分類かどうか
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::InterfaceError
                | ErrorKind::CommandError { do_not_retry: false, .. }
        )
    }

    /// 残りのリトライ予算を消費せず即座に閾値監視へ回すべきか
    pub fn short_circuits_retry(&self) -> bool {
        match self {
            ErrorKind::Fatal => true,
            ErrorKind::CommandError { do_not_retry, .. } => *do_not_retry,
            _ => false,
        }
    }

    /// 終端状態（これ以上ハードウェアに触れてはならない）か
    pub fn is_terminal(&self) -> bool {
        matches!(self, ErrorKind::ResetFailed | ErrorKind::DeviceUnusable)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Timeout => write!(f, "command timeout"),
            ErrorKind::InterfaceError => write!(f, "transient interface error"),
            ErrorKind::CommandError { code, do_not_retry } => write!(
                f,
                "command rejected: code={:#06x}, dnr={}",
                code, do_not_retry
            ),
            ErrorKind::Fatal => write!(f, "fatal interface error"),
            ErrorKind::ResetFailed => write!(f, "controller reset failed"),
            ErrorKind::DeviceUnusable => write!(f, "device permanently unusable"),
        }
    }
}

// ============================================================================
// IoError - caller-visible error
// ============================================================================

/// ブロックAPI呼び出し側に見えるエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// リトライ予算とリセットの双方を使い果たしたデバイス障害
    Device(ErrorKind),
    /// 空きコマンドスロットなし
    ///
    /// デバイス障害ではない。呼び出し側はリクエストをキューイングするか
    /// 割り当てを再試行する。リング層内部で握り潰してはならない。
    RingFull,
    /// `lba + count` がデバイス容量を超えている
    OutOfRange,
    /// バッファが `count * block_size` に満たない
    ShortBuffer,
    /// デバイスがこの操作をサポートしない（例: TRIM）
    Unsupported,
}

impl IoError {
    /// 恒久的障害（以後の呼び出しも必ず同じ結果になる）か
    pub fn is_permanent(&self) -> bool {
        matches!(self, IoError::Device(kind) if kind.is_terminal())
    }
}

impl From<ErrorKind> for IoError {
    fn from(kind: ErrorKind) -> Self {
        IoError::Device(kind)
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoError::Device(kind) => write!(f, "device error: {}", kind),
            IoError::RingFull => write!(f, "command ring full"),
            IoError::OutOfRange => write!(f, "block range out of bounds"),
            IoError::ShortBuffer => write!(f, "buffer too small for request"),
            IoError::Unsupported => write!(f, "operation not supported"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
