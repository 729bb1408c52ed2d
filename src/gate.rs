// 该文件是 Qianli （千里眼） 项目的一部分。
// src/gate.rs - 单槽帧准入
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::sync::{
  Arc,
  atomic::{AtomicBool, AtomicU64, Ordering},
};

use tracing::trace;

use crate::frame::RawFrame;

#[derive(Debug, Default)]
struct GateState {
  busy: AtomicBool,
  admitted: AtomicU64,
  dropped: AtomicU64,
}

/// 同一时刻最多一帧在处理，忙时到达的帧直接丢弃
#[derive(Debug, Clone, Default)]
pub struct FrameGate {
  state: Arc<GateState>,
}

impl FrameGate {
  pub fn new() -> Self {
    Self::default()
  }

  /// 空闲时接纳该帧并立即进入忙碌状态；忙碌时释放该帧并返回 `None`
  pub fn try_admit(&self, frame: RawFrame) -> Option<Admitted> {
    if self
      .state
      .busy
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
    {
      self.state.admitted.fetch_add(1, Ordering::Relaxed);
      trace!("接纳第 {} 帧", frame.index());
      Some(Admitted {
        frame,
        _busy: BusyGuard(self.state.clone()),
      })
    } else {
      self.state.dropped.fetch_add(1, Ordering::Relaxed);
      trace!("处理中, 丢弃第 {} 帧", frame.index());
      None
    }
  }

  pub fn is_busy(&self) -> bool {
    self.state.busy.load(Ordering::Acquire)
  }

  pub fn admitted(&self) -> u64 {
    self.state.admitted.load(Ordering::Relaxed)
  }

  pub fn dropped(&self) -> u64 {
    self.state.dropped.load(Ordering::Relaxed)
  }
}

/// 准入凭证，持有帧；drop 时先释放帧再清除忙碌标志
#[derive(Debug)]
pub struct Admitted {
  // 字段按声明顺序释放
  frame: RawFrame,
  _busy: BusyGuard,
}

impl Admitted {
  pub fn frame(&self) -> &RawFrame {
    &self.frame
  }
}

#[derive(Debug)]
struct BusyGuard(Arc<GateState>);

impl Drop for BusyGuard {
  fn drop(&mut self) {
    self.0.busy.store(false, Ordering::Release);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;

  fn counted_frame(index: u64, released: &Arc<AtomicUsize>) -> RawFrame {
    let released = released.clone();
    RawFrame::empty(8, 8)
      .with_index(index)
      .with_release(move || {
        released.fetch_add(1, Ordering::SeqCst);
      })
  }

  #[test]
  fn idle_gate_admits_and_becomes_busy() {
    let gate = FrameGate::new();
    let released = Arc::new(AtomicUsize::new(0));

    let ticket = gate.try_admit(counted_frame(0, &released));
    assert!(ticket.is_some());
    assert!(gate.is_busy());
    assert_eq!(released.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn busy_gate_rejects_and_releases_every_frame() {
    let gate = FrameGate::new();
    let released = Arc::new(AtomicUsize::new(0));

    let ticket = gate.try_admit(counted_frame(0, &released)).unwrap();
    let admitted = (1..=5)
      .filter_map(|i| gate.try_admit(counted_frame(i, &released)))
      .count();

    assert_eq!(admitted, 0);
    assert_eq!(released.load(Ordering::SeqCst), 5);
    assert_eq!(gate.dropped(), 5);
    assert_eq!(ticket.frame().index(), 0);
  }

  #[test]
  fn dropping_ticket_releases_frame_and_rearms_gate() {
    let gate = FrameGate::new();
    let released = Arc::new(AtomicUsize::new(0));

    let ticket = gate.try_admit(counted_frame(0, &released)).unwrap();
    drop(ticket);
    assert!(!gate.is_busy());
    assert_eq!(released.load(Ordering::SeqCst), 1);

    assert!(gate.try_admit(counted_frame(1, &released)).is_some());
    assert_eq!(gate.admitted(), 2);
    // 第二张凭证在语句结束时已释放
    assert_eq!(released.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn only_one_of_many_concurrent_offers_is_admitted() {
    let gate = FrameGate::new();
    let released = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = std::sync::mpsc::channel();

    std::thread::scope(|scope| {
      for i in 0..8 {
        let gate = gate.clone();
        let released = released.clone();
        let tx = tx.clone();
        scope.spawn(move || {
          if let Some(ticket) = gate.try_admit(counted_frame(i, &released)) {
            tx.send(ticket).unwrap();
          }
        });
      }
    });
    drop(tx);

    let tickets: Vec<_> = rx.iter().collect();
    assert_eq!(tickets.len(), 1);
    assert_eq!(released.load(Ordering::SeqCst), 7);
    drop(tickets);
    assert_eq!(released.load(Ordering::SeqCst), 8);
  }
}
