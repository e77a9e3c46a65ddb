// completion.rs — synchronizer between core callbacks and command waiters
//
// The core reports save/load/screenshot completions through its state-change
// callback and publishes frame indices through its frame callback, both on
// the emulator thread. The board keeps a (seq, last_result) cell per
// completion class plus the last frame index, all under one mutex with a
// condvar for waiters.
//
// The liveness hazard: completion callbacks only fire while frames advance,
// and frames do not advance while the emulator is paused. Every completion
// wait therefore steps the emulator one frame per iteration whenever it
// observes the paused state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::core::{Core, CoreEvent, CoreEvents};

/// How long command handlers wait for an asynchronous completion.
pub const COMPLETION_TIMEOUT: Duration = Duration::from_secs(5);

// granularity of stop-flag checks while blocked on the condvar
const WAIT_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cell {
    /// Strictly increasing count of delivered completions.
    pub seq: u32,
    /// Core-reported value of the most recent completion (0 means failed).
    pub last_result: i32,
}

#[derive(Default)]
struct BoardState {
    state_load: Cell,
    state_save: Cell,
    screenshot: Cell,
    frame: u32,
}

impl BoardState {
    fn cell_mut(&mut self, event: CoreEvent) -> &mut Cell {
        match event {
            CoreEvent::StateLoadComplete => &mut self.state_load,
            CoreEvent::StateSaveComplete => &mut self.state_save,
            CoreEvent::ScreenshotCaptured => &mut self.screenshot,
        }
    }

    fn cell(&self, event: CoreEvent) -> Cell {
        match event {
            CoreEvent::StateLoadComplete => self.state_load,
            CoreEvent::StateSaveComplete => self.state_save,
            CoreEvent::ScreenshotCaptured => self.screenshot,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The seq advanced past the snapshot; carries the refreshed
    /// last_result.
    Completed(i32),
    TimedOut,
    Stopped,
}

pub struct CompletionBoard {
    state: Mutex<BoardState>,
    cond: Condvar,
}

impl CompletionBoard {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BoardState::default()),
            cond: Condvar::new(),
        }
    }

    /// Snapshot a completion cell. Callers record `cell(ev).seq` *before*
    /// issuing the triggering core command.
    pub fn cell(&self, event: CoreEvent) -> Cell {
        self.state.lock().unwrap().cell(event)
    }

    /// Latest frame index published by the core's frame callback. Stale
    /// while the core is paused.
    pub fn last_frame(&self) -> u32 {
        self.state.lock().unwrap().frame
    }

    /// Block until the frame counter strictly exceeds `frame_before`, the
    /// budget runs out, or the stop flag is raised.
    pub fn wait_frame_advance(
        &self,
        frame_before: u32,
        budget: Duration,
        stop: &AtomicBool,
    ) -> bool {
        let deadline = Instant::now() + budget;
        let mut st = self.state.lock().unwrap();
        loop {
            if st.frame > frame_before {
                return true;
            }
            if stop.load(Ordering::SeqCst) {
                return false;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            let (guard, _) = self
                .cond
                .wait_timeout(st, remaining.min(WAIT_SLICE))
                .unwrap();
            st = guard;
        }
    }

    /// Wait for `event`'s seq to move past `previous`, stepping the core
    /// one frame per iteration while it is paused so the completion can
    /// actually be delivered. Core failures while probing or stepping are
    /// reported as timeouts; the caller replies with one error either way.
    pub fn wait_completion(
        &self,
        event: CoreEvent,
        previous: u32,
        timeout: Duration,
        core: &dyn Core,
        stop: &AtomicBool,
    ) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let st = self.state.lock().unwrap();
                let cell = st.cell(event);
                if cell.seq != previous {
                    return WaitOutcome::Completed(cell.last_result);
                }
            }
            if stop.load(Ordering::SeqCst) {
                return WaitOutcome::Stopped;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return WaitOutcome::TimedOut;
            };

            let Ok(emu_state) = core.emu_state() else {
                return WaitOutcome::TimedOut;
            };
            if emu_state != crate::core::EmuState::Paused {
                // running (or stopping): the emulator loop delivers the
                // callback on its own; just wait for a board change
                let st = self.state.lock().unwrap();
                drop(
                    self.cond
                        .wait_timeout(st, remaining.min(WAIT_SLICE))
                        .unwrap(),
                );
                continue;
            }

            // paused: the callback cannot fire until a frame advances
            let frame_before = self.last_frame();
            if core.advance_frame().is_err() {
                return WaitOutcome::TimedOut;
            }
            if !self.wait_frame_advance(frame_before, remaining, stop) {
                return if stop.load(Ordering::SeqCst) {
                    WaitOutcome::Stopped
                } else {
                    WaitOutcome::TimedOut
                };
            }
        }
    }
}

impl Default for CompletionBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl CoreEvents for CompletionBoard {
    fn state_changed(&self, event: CoreEvent, value: i32) {
        let mut st = self.state.lock().unwrap();
        let cell = st.cell_mut(event);
        // last_result first, then the seq bump that publishes it
        cell.last_result = value;
        cell.seq = cell.seq.wrapping_add(1);
        drop(st);
        self.cond.notify_all();
    }

    fn frame(&self, index: u32) {
        self.state.lock().unwrap().frame = index;
        self.cond.notify_all();
    }
}

// ── tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DummyCore;
    use std::sync::Arc;

    #[test]
    fn callback_bumps_seq_and_refreshes_result() {
        let board = CompletionBoard::new();
        let before = board.cell(CoreEvent::StateSaveComplete);
        board.state_changed(CoreEvent::StateSaveComplete, 1);
        let after = board.cell(CoreEvent::StateSaveComplete);
        assert_eq!(after.seq, before.seq + 1);
        assert_eq!(after.last_result, 1);
        // other classes untouched
        assert_eq!(board.cell(CoreEvent::StateLoadComplete).seq, 0);
    }

    #[test]
    fn frame_wait_succeeds_on_strict_advance() {
        let board = Arc::new(CompletionBoard::new());
        let stop = AtomicBool::new(false);
        board.frame(10);
        assert!(!board.wait_frame_advance(10, Duration::from_millis(30), &stop));

        let waiter = board.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waiter.frame(11);
        });
        assert!(board.wait_frame_advance(10, Duration::from_secs(1), &stop));
        handle.join().unwrap();
    }

    #[test]
    fn stop_flag_aborts_waiters() {
        let board = CompletionBoard::new();
        let stop = AtomicBool::new(true);
        assert!(!board.wait_frame_advance(0, Duration::from_secs(5), &stop));

        let core = DummyCore::new();
        let outcome = board.wait_completion(
            CoreEvent::ScreenshotCaptured,
            0,
            Duration::from_secs(5),
            &core,
            &stop,
        );
        assert_eq!(outcome, WaitOutcome::Stopped);
    }

    #[test]
    fn paused_core_completes_via_stepping() {
        let core = DummyCore::new();
        let board = Arc::new(CompletionBoard::new());
        core.set_event_sink(board.clone());
        core.pause().unwrap();

        let previous = board.cell(CoreEvent::StateSaveComplete).seq;
        core.save_state(None, 0).unwrap();
        let stop = AtomicBool::new(false);
        let outcome = board.wait_completion(
            CoreEvent::StateSaveComplete,
            previous,
            Duration::from_secs(5),
            &core,
            &stop,
        );
        assert_eq!(outcome, WaitOutcome::Completed(1));
        assert_eq!(board.cell(CoreEvent::StateSaveComplete).seq, previous + 1);
        // the wait itself drove the emulator forward
        assert!(core.frame() > 0);
    }

    #[test]
    fn paused_wait_times_out_when_nothing_completes() {
        let core = DummyCore::new();
        let board = Arc::new(CompletionBoard::new());
        core.set_event_sink(board.clone());
        core.pause().unwrap();

        let stop = AtomicBool::new(false);
        let outcome = board.wait_completion(
            CoreEvent::StateLoadComplete,
            board.cell(CoreEvent::StateLoadComplete).seq,
            Duration::from_millis(50),
            &core,
            &stop,
        );
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[test]
    fn running_core_completes_without_stepping() {
        let core = DummyCore::new();
        let board = Arc::new(CompletionBoard::new());
        core.set_event_sink(board.clone());

        let previous = board.cell(CoreEvent::ScreenshotCaptured).seq;
        core.take_screenshot().unwrap();
        let stop = AtomicBool::new(false);
        let outcome = board.wait_completion(
            CoreEvent::ScreenshotCaptured,
            previous,
            Duration::from_secs(5),
            &core,
            &stop,
        );
        assert_eq!(outcome, WaitOutcome::Completed(1));
    }
}
