// ============================================================================
// src/ring/completion.rs - Completion Ring with Phase Bit
// ============================================================================
//!
//! # コンプリーションリング
//!
//! ハードウェアが完了エントリを書き込む固定容量リング。エントリが「新しい」
//! のは、埋め込まれたフェーズビットがリングの期待フェーズと一致する場合
//! のみ。コンシューマがリング境界を跨ぐたびに期待フェーズを反転する。
//!
//! この方式は別個の valid フラグやクリア手順なしに、O(1) のポーリングで
//! 「未完了」と「過去の残骸データ」を区別できる。完了は発行順と一致する
//! 保証がない（アウトオブオーダー完了）ため、照合はリング位置ではなく
//! エントリ内のコマンドIDで行う。

use alloc::alloc::{Layout, alloc_zeroed, dealloc};
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicU16, Ordering};

use crate::dma::DMA_ALIGNMENT;

/// 完了エントリの共通読み出し
pub trait CompletionEntry: Copy {
    /// エントリに埋め込まれたフェーズビット
    fn phase(&self) -> bool;

    /// 発行時のスロットへ対応づくコマンドID
    fn command_id(&self) -> u16;
}

// ============================================================================
// Completion Ring
// ============================================================================

/// コンプリーションリング
///
/// 容量はサブミッションリングと異なっていてよい。
pub struct CompletionRing<E: CompletionEntry> {
    /// リングメモリ（デバイスが書き込む）
    base: NonNull<E>,
    layout: Layout,
    /// キュー深度
    depth: u16,
    /// コンシューマインデックス
    head: AtomicU16,
    /// 期待フェーズ
    ///
    /// 初期値 true: ゼロ初期化されたリングではどのエントリも
    /// phase=false なので、初回ラップまでは未書き込みエントリが
    /// 決して「新しい」と判定されない。
    phase: AtomicBool,
}

// Safety: リングメモリは排他所有で、インデックス更新はアトミック
unsafe impl<E: CompletionEntry + Send> Send for CompletionRing<E> {}
unsafe impl<E: CompletionEntry + Send> Sync for CompletionRing<E> {}

impl<E: CompletionEntry> CompletionRing<E> {
    /// 指定深度のリングを割り当てる
    pub fn new(depth: u16) -> Option<Self> {
        assert!(depth >= 2);
        let layout =
            Layout::from_size_align(core::mem::size_of::<E>() * depth as usize, DMA_ALIGNMENT)
                .ok()?;
        let raw = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(raw as *mut E)?;
        Some(Self {
            base,
            layout,
            depth,
            head: AtomicU16::new(0),
            phase: AtomicBool::new(true),
        })
    }

    /// キュー深度を取得
    pub fn depth(&self) -> u16 {
        self.depth
    }

    /// デバイス可視ベースアドレス
    pub fn device_addr(&self) -> u64 {
        self.base.as_ptr() as u64
    }

    /// 現在のコンシューマインデックス
    pub fn head(&self) -> u16 {
        self.head.load(Ordering::Acquire)
    }

    /// 現在の期待フェーズ
    pub fn expected_phase(&self) -> bool {
        self.phase.load(Ordering::Acquire)
    }

    /// 先頭エントリをポーリング（消費しない）
    ///
    /// フェーズ不一致なら `None`（= まだ完了が届いていない）。
    pub fn poll(&self) -> Option<E> {
        let head = self.head.load(Ordering::Acquire);
        let expected = self.phase.load(Ordering::Acquire);

        let entry = unsafe {
            let slot = self.base.as_ptr().add(head as usize);
            ptr::read_volatile(slot)
        };

        if entry.phase() != expected {
            return None;
        }
        Some(entry)
    }

    /// 先頭エントリを消費してコンシューマインデックスを進める
    ///
    /// リング境界を跨いだとき期待フェーズを反転する。
    pub fn consume(&self) -> Option<E> {
        let entry = self.poll()?;

        let head = self.head.load(Ordering::Acquire);
        let new_head = (head + 1) % self.depth;
        if new_head == 0 {
            let current = self.phase.load(Ordering::Acquire);
            self.phase.store(!current, Ordering::Release);
        }
        self.head.store(new_head, Ordering::Release);
        Some(entry)
    }

    /// インデックスとフェーズを初期状態に戻しメモリをゼロ埋めする
    ///
    /// リセット用。リングは再割り当てしない。
    pub fn reinit(&self) {
        unsafe {
            ptr::write_bytes(self.base.as_ptr() as *mut u8, 0, self.layout.size());
        }
        self.head.store(0, Ordering::Release);
        self.phase.store(true, Ordering::Release);
    }

    /// リングメモリへの生ポインタ
    ///
    /// ハードウェア（またはテストのデバイスエミュレーション）が
    /// エントリを書き込むために使用する。
    pub fn as_ptr(&self) -> *mut E {
        self.base.as_ptr()
    }
}

impl<E: CompletionEntry> Drop for CompletionRing<E> {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr() as *mut u8, self.layout) };
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    struct TestEntry {
        cid: u16,
        status: u16,
    }

    impl CompletionEntry for TestEntry {
        fn phase(&self) -> bool {
            self.status & 1 != 0
        }
        fn command_id(&self) -> u16 {
            self.cid
        }
    }

    /// デバイス側の書き込みを模す
    struct FakeProducer {
        tail: u16,
        phase: bool,
    }

    impl FakeProducer {
        fn new() -> Self {
            Self { tail: 0, phase: true }
        }

        fn post(&mut self, ring: &CompletionRing<TestEntry>, cid: u16) {
            let entry = TestEntry {
                cid,
                status: if self.phase { 1 } else { 0 },
            };
            unsafe {
                ptr::write_volatile(ring.as_ptr().add(self.tail as usize), entry);
            }
            self.tail = (self.tail + 1) % ring.depth();
            if self.tail == 0 {
                self.phase = !self.phase;
            }
        }
    }

    #[test]
    fn test_empty_ring_yields_nothing() {
        let ring: CompletionRing<TestEntry> = CompletionRing::new(4).unwrap();
        assert!(ring.poll().is_none());
        assert!(ring.consume().is_none());
    }

    #[test]
    fn test_consume_in_order() {
        let ring: CompletionRing<TestEntry> = CompletionRing::new(4).unwrap();
        let mut hw = FakeProducer::new();
        hw.post(&ring, 7);
        hw.post(&ring, 8);

        assert_eq!(ring.consume().unwrap().command_id(), 7);
        assert_eq!(ring.consume().unwrap().command_id(), 8);
        assert!(ring.consume().is_none());
    }

    #[test]
    fn test_phase_flip_over_wrap() {
        // M 容量のリングに M+1 エントリ: 期待フェーズはちょうど1回反転し、
        // エントリ M は位置0の過去データと正しく区別される
        const M: u16 = 4;
        let ring: CompletionRing<TestEntry> = CompletionRing::new(M).unwrap();
        let mut hw = FakeProducer::new();

        assert!(ring.expected_phase());
        for cid in 0..M {
            hw.post(&ring, cid);
            assert_eq!(ring.consume().unwrap().command_id(), cid);
        }
        // ラップ完了: 期待フェーズが反転している
        assert!(!ring.expected_phase());

        // 位置0には旧フェーズの残骸 (cid=0) が居座っているが、
        // フェーズ不一致により新エントリとは判定されない
        assert!(ring.poll().is_none());

        hw.post(&ring, M);
        assert_eq!(ring.consume().unwrap().command_id(), M);
        assert!(!ring.expected_phase());
    }

    #[test]
    fn test_double_wrap_phase_returns() {
        const M: u16 = 2;
        let ring: CompletionRing<TestEntry> = CompletionRing::new(M).unwrap();
        let mut hw = FakeProducer::new();

        for cid in 0..(2 * M) {
            hw.post(&ring, cid);
            assert_eq!(ring.consume().unwrap().command_id(), cid);
        }
        // 2回ラップして元のフェーズに戻る
        assert!(ring.expected_phase());
    }

    #[test]
    fn test_reinit() {
        let ring: CompletionRing<TestEntry> = CompletionRing::new(4).unwrap();
        let mut hw = FakeProducer::new();
        hw.post(&ring, 1);
        ring.consume().unwrap();

        let addr = ring.device_addr();
        ring.reinit();
        assert_eq!(ring.device_addr(), addr);
        assert_eq!(ring.head(), 0);
        assert!(ring.expected_phase());
        assert!(ring.poll().is_none());

        let mut hw = FakeProducer::new();
        hw.post(&ring, 9);
        assert_eq!(ring.consume().unwrap().command_id(), 9);
    }
}
