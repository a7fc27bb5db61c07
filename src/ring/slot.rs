// ============================================================================
// src/ring/slot.rs - Command Slot Allocator
// ============================================================================
//!
//! # スロットアロケータ
//!
//! サブミッションリングのコマンドスロットを管理する。スロットは
//! `Free → Issued → Completed|TimedOut` と遷移し、完了（または失敗）が
//! 消費された後にのみアロケータへ返却される。
//!
//! 空き判定はソフトウェア発行ビットマップとハードウェア側アクティブ表示
//! （AHCIの PxSACT|PxCI のようにコントローラが直接公開するもの）の和集合。
//! 同一スロットが同時に2つの呼び出し側へ渡ることは絶対に許されない。
//! スロットNへの二重発行はハードウェア状態を破壊する。

use core::sync::atomic::{AtomicU32, Ordering};

/// コマンドスロット番号（型安全）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(pub u8);

impl SlotId {
    /// 1リングあたりの最大スロット数
    pub const MAX_SLOTS: u8 = 32;

    pub fn is_valid(&self) -> bool {
        self.0 < Self::MAX_SLOTS
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn as_u16(&self) -> u16 {
        self.0 as u16
    }

    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }

    /// スロットに対応するビットマスク
    pub fn mask(&self) -> u32 {
        1u32 << self.0
    }
}

// ============================================================================
// Slot Table
// ============================================================================

/// スロット占有ビットマップ
///
/// 割り当ては CAS ループなのでエンジンロック外から呼ばれても
/// 二重割り当ては起きないが、発行順序の保証はロック側の責務。
pub struct SlotTable {
    /// ソフトウェアが発行中としてマークしたスロット
    issued: AtomicU32,
    /// スロット数（`capacity` ≤ 32）
    capacity: u8,
}

impl SlotTable {
    /// 指定容量のスロットテーブルを作成
    pub fn new(capacity: u8) -> Self {
        assert!(capacity >= 1 && capacity <= SlotId::MAX_SLOTS);
        Self {
            issued: AtomicU32::new(0),
            capacity,
        }
    }

    /// スロット数を取得
    pub fn capacity(&self) -> u8 {
        self.capacity
    }

    /// 発行中スロットのビットマップ
    pub fn issued_mask(&self) -> u32 {
        self.issued.load(Ordering::Acquire)
    }

    /// 発行中スロット数
    pub fn in_flight(&self) -> u32 {
        self.issued_mask().count_ones()
    }

    /// 空きスロットを割り当てる
    ///
    /// `hw_active` はハードウェアが busy として報告しているスロットの
    /// ビットマップ。空きがなければ `None`（リングフル）。ブロックしない。
    pub fn allocate(&self, hw_active: u32) -> Option<SlotId> {
        loop {
            let issued = self.issued.load(Ordering::Acquire);
            let busy = issued | hw_active;

            let mut free = None;
            for i in 0..self.capacity {
                if busy & (1 << i) == 0 {
                    free = Some(i);
                    break;
                }
            }
            let slot = free?;

            if self
                .issued
                .compare_exchange(
                    issued,
                    issued | (1 << slot),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Some(SlotId(slot));
            }
            // 競合した場合はビットマップを読み直す
        }
    }

    /// スロットを返却する
    ///
    /// 完了（または失敗）が消費された後にのみ呼ぶこと。
    pub fn release(&self, slot: SlotId) {
        self.issued.fetch_and(!slot.mask(), Ordering::AcqRel);
    }

    /// 全スロットを強制返却（リセット時のリング再初期化用）
    pub fn clear(&self) {
        self.issued.store(0, Ordering::Release);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_until_full() {
        let table = SlotTable::new(4);
        let mut got = alloc::vec::Vec::new();
        for _ in 0..4 {
            got.push(table.allocate(0).expect("slot available"));
        }
        // N+1回目の割り当てはコマンド発行前にリングフルを返す
        assert!(table.allocate(0).is_none());
        // 重複なし
        got.sort();
        got.dedup();
        assert_eq!(got.len(), 4);
    }

    #[test]
    fn test_release_recycles() {
        let table = SlotTable::new(2);
        let a = table.allocate(0).unwrap();
        let _b = table.allocate(0).unwrap();
        assert!(table.allocate(0).is_none());
        table.release(a);
        assert_eq!(table.allocate(0), Some(a));
    }

    #[test]
    fn test_hw_active_mask_respected() {
        let table = SlotTable::new(4);
        // ハードウェアがスロット0,1をbusy報告している
        let slot = table.allocate(0b0011).unwrap();
        assert!(slot.as_u8() >= 2);
    }

    #[test]
    fn test_no_double_allocation_concurrent() {
        use std::sync::Arc;

        let table = Arc::new(SlotTable::new(32));
        let mut handles = std::vec::Vec::new();
        for _ in 0..8 {
            let table = Arc::clone(&table);
            handles.push(std::thread::spawn(move || {
                let mut mine = std::vec::Vec::new();
                for _ in 0..4 {
                    if let Some(slot) = table.allocate(0) {
                        mine.push(slot.as_u8());
                    }
                }
                mine
            }));
        }

        let mut all: std::vec::Vec<u8> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort();
        all.dedup();
        // 同一スロットが2つの呼び出し側に渡っていないこと
        assert_eq!(all.len(), total);
    }

    #[test]
    fn test_clear_on_reset() {
        let table = SlotTable::new(4);
        for _ in 0..4 {
            table.allocate(0).unwrap();
        }
        table.clear();
        assert_eq!(table.in_flight(), 0);
        assert!(table.allocate(0).is_some());
    }
}
