// core.rs — interface to the emulation core, plus the built-in dummy core
//
// The real emulator library lives behind the `Core` trait: a synchronous
// command surface called from the agent server thread, and a callback
// surface (`CoreEvents`) invoked from the emulator thread. `DummyCore` is a
// deterministic in-process stand-in used by the development binary and the
// test suite; it reproduces the one property everything downstream depends
// on: completion events only fire when a frame advances.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;

// ── status codes ──────────────────────────────────────────────────────────────

pub type CoreResult<T> = Result<T, CoreError>;

/// Non-success status from the core command surface. The numeric codes are
/// part of the wire protocol (`core command failed (N)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("core not initialized")]
    NotInit,
    #[error("core already initialized")]
    AlreadyInit,
    #[error("incompatible core version")]
    Incompatible,
    #[error("invalid input assertion")]
    InputAssert,
    #[error("invalid input parameter")]
    InputInvalid,
    #[error("input not found")]
    InputNotFound,
    #[error("out of memory")]
    NoMemory,
    #[error("file access error")]
    Files,
    #[error("internal core error")]
    Internal,
    #[error("invalid emulation state for command")]
    InvalidState,
    #[error("plugin failure")]
    PluginFail,
    #[error("system failure")]
    SystemFail,
    #[error("operation not supported")]
    Unsupported,
    #[error("wrong parameter type")]
    WrongType,
}

impl CoreError {
    pub fn code(self) -> i32 {
        match self {
            CoreError::NotInit => 1,
            CoreError::AlreadyInit => 2,
            CoreError::Incompatible => 3,
            CoreError::InputAssert => 4,
            CoreError::InputInvalid => 5,
            CoreError::InputNotFound => 6,
            CoreError::NoMemory => 7,
            CoreError::Files => 8,
            CoreError::Internal => 9,
            CoreError::InvalidState => 10,
            CoreError::PluginFail => 11,
            CoreError::SystemFail => 12,
            CoreError::Unsupported => 13,
            CoreError::WrongType => 14,
        }
    }
}

// ── core-side types ───────────────────────────────────────────────────────────

/// Emulation state, with the numeric encoding the wire protocol reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmuState {
    Stopped,
    Running,
    Paused,
}

impl EmuState {
    pub fn code(self) -> i32 {
        match self {
            EmuState::Stopped => 1,
            EmuState::Running => 2,
            EmuState::Paused => 3,
        }
    }
}

/// Access width for the debugger memory accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemWidth {
    W8,
    W16,
    W32,
    W64,
}

impl MemWidth {
    pub fn from_bits(bits: i64) -> Option<Self> {
        match bits {
            8 => Some(MemWidth::W8),
            16 => Some(MemWidth::W16),
            32 => Some(MemWidth::W32),
            64 => Some(MemWidth::W64),
            _ => None,
        }
    }

    pub fn bits(self) -> u32 {
        match self {
            MemWidth::W8 => 8,
            MemWidth::W16 => 16,
            MemWidth::W32 => 32,
            MemWidth::W64 => 64,
        }
    }

    fn mask(self) -> u64 {
        match self {
            MemWidth::W8 => 0xff,
            MemWidth::W16 => 0xffff,
            MemWidth::W32 => 0xffff_ffff,
            MemWidth::W64 => u64::MAX,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub debugger: bool,
}

/// A time-windowed input committed to the core's input queue.
/// The window is inclusive on both ends, in frame indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedInput {
    pub port: usize,
    pub input: u32,
    pub first_frame: u32,
    pub last_frame: u32,
}

// ── callback surface ──────────────────────────────────────────────────────────

/// Completion classes delivered through the core's state-change callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreEvent {
    StateLoadComplete,
    StateSaveComplete,
    ScreenshotCaptured,
}

/// Receiver for asynchronous core notifications. Invoked from the emulator
/// thread, so implementations must be cheap and lock-careful.
pub trait CoreEvents: Send + Sync {
    fn state_changed(&self, event: CoreEvent, value: i32);
    fn frame(&self, index: u32);
}

// ── command surface ───────────────────────────────────────────────────────────

/// Synchronous command entrypoint of the emulation core. Safe to call from
/// the agent server thread for every method here.
pub trait Core: Send + Sync {
    fn set_event_sink(&self, sink: Arc<dyn CoreEvents>);
    fn capabilities(&self) -> Capabilities;

    fn pause(&self) -> CoreResult<()>;
    fn resume(&self) -> CoreResult<()>;
    fn stop(&self) -> CoreResult<()>;
    /// Queue a single-frame advance. The new frame is observed through the
    /// frame callback, not through this call's return.
    fn advance_frame(&self) -> CoreResult<()>;

    fn emu_state(&self) -> CoreResult<EmuState>;
    fn video_size(&self) -> CoreResult<(u32, u32)>;
    fn speed_factor(&self) -> CoreResult<i32>;
    fn set_speed_factor(&self, percent: i32) -> CoreResult<()>;
    fn speed_limiter(&self) -> CoreResult<bool>;
    fn set_speed_limiter(&self, enabled: bool) -> CoreResult<()>;
    fn state_slot(&self) -> CoreResult<i32>;
    fn set_state_slot(&self, slot: i32) -> CoreResult<()>;

    fn save_state(&self, path: Option<&str>, format: i32) -> CoreResult<()>;
    fn load_state(&self, path: Option<&str>) -> CoreResult<()>;
    fn take_screenshot(&self) -> CoreResult<()>;

    fn set_input(&self, port: usize, state: u32) -> CoreResult<()>;
    fn queue_input(&self, queued: QueuedInput) -> CoreResult<()>;
    /// Clear one port's input, or all ports when `port` is `None`.
    fn clear_input(&self, port: Option<usize>) -> CoreResult<()>;

    /// Fill `buf` with packed RGB triplets (row-major, top-left origin).
    /// `buf` must hold `width * height * 3` bytes.
    fn read_screen(&self, front: bool, buf: &mut [u8]) -> CoreResult<()>;
    /// Fill `buf` with one 16-bit depth value per pixel. Returns
    /// `Unsupported` when the video plugin cannot read depth.
    fn read_depth(&self, front: bool, buf: &mut [u16]) -> CoreResult<()>;

    fn mem_read(&self, addr: u32, width: MemWidth) -> CoreResult<u64>;
    fn mem_write(&self, addr: u32, width: MemWidth, value: u64) -> CoreResult<()>;
}

// ── dummy core ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveRequest {
    pub path: Option<String>,
    pub format: i32,
}

struct DummyState {
    emu_state: EmuState,
    frame: u32,
    speed_factor: i32,
    speed_limiter: bool,
    state_slot: i32,
    video: (u32, u32),
    inputs: [u32; 4],
    queued: Vec<QueuedInput>,
    // completions armed by save/load/screenshot; fired on the next frame
    pending: Vec<(CoreEvent, i32)>,
    memory: HashMap<u32, u64>,
    last_save: Option<SaveRequest>,
    fail_next_save: bool,
    fail_next_load: bool,
}

struct DummyShared {
    inner: Mutex<DummyState>,
    sink: Mutex<Option<Arc<dyn CoreEvents>>>,
}

impl DummyShared {
    /// Advance one frame and deliver the frame callback plus any armed
    /// completion events, in that order, outside the state lock.
    fn step_frame(&self) {
        let (frame, pending) = {
            let mut st = self.inner.lock().unwrap();
            st.frame = st.frame.wrapping_add(1);
            (st.frame, std::mem::take(&mut st.pending))
        };
        self.deliver(frame, pending);
    }

    /// Ticker variant: the Running check and the step happen under one
    /// lock, so a pause observed by a client cannot race a stray frame.
    fn tick_if_running(&self) {
        let stepped = {
            let mut st = self.inner.lock().unwrap();
            if st.emu_state != EmuState::Running {
                None
            } else {
                st.frame = st.frame.wrapping_add(1);
                Some((st.frame, std::mem::take(&mut st.pending)))
            }
        };
        if let Some((frame, pending)) = stepped {
            self.deliver(frame, pending);
        }
    }

    fn deliver(&self, frame: u32, pending: Vec<(CoreEvent, i32)>) {
        let sink = self.sink.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink.frame(frame);
            for (event, value) in pending {
                sink.state_changed(event, value);
            }
        }
    }
}

/// In-process core used when no emulator library is attached: the binary's
/// development mode and the test suite both run against it. Frames tick on a
/// background thread while Running; `advance_frame` steps exactly one frame
/// while Paused.
pub struct DummyCore {
    shared: Arc<DummyShared>,
    caps: Capabilities,
    depth_supported: bool,
    ticker_stop: Arc<AtomicBool>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl DummyCore {
    pub fn new() -> Self {
        Self::with_options(Capabilities { debugger: true }, true)
    }

    pub fn with_options(caps: Capabilities, depth_supported: bool) -> Self {
        let shared = Arc::new(DummyShared {
            inner: Mutex::new(DummyState {
                emu_state: EmuState::Running,
                frame: 0,
                speed_factor: 100,
                speed_limiter: true,
                state_slot: 0,
                video: (640, 480),
                inputs: [0; 4],
                queued: Vec::new(),
                pending: Vec::new(),
                memory: HashMap::new(),
                last_save: None,
                fail_next_save: false,
                fail_next_load: false,
            }),
            sink: Mutex::new(None),
        });

        let ticker_stop = Arc::new(AtomicBool::new(false));
        let ticker = {
            let shared = shared.clone();
            let stop = ticker_stop.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    shared.tick_if_running();
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
        };

        Self {
            shared,
            caps,
            depth_supported,
            ticker_stop,
            ticker: Mutex::new(Some(ticker)),
        }
    }

    // test / inspection knobs

    pub fn set_video_size(&self, width: u32, height: u32) {
        self.shared.inner.lock().unwrap().video = (width, height);
    }

    pub fn fail_next_save(&self) {
        self.shared.inner.lock().unwrap().fail_next_save = true;
    }

    pub fn fail_next_load(&self) {
        self.shared.inner.lock().unwrap().fail_next_load = true;
    }

    pub fn frame(&self) -> u32 {
        self.shared.inner.lock().unwrap().frame
    }

    pub fn input(&self, port: usize) -> u32 {
        self.shared.inner.lock().unwrap().inputs[port]
    }

    pub fn queued_inputs(&self) -> Vec<QueuedInput> {
        self.shared.inner.lock().unwrap().queued.clone()
    }

    pub fn last_save(&self) -> Option<SaveRequest> {
        self.shared.inner.lock().unwrap().last_save.clone()
    }
}

impl Default for DummyCore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DummyCore {
    fn drop(&mut self) {
        self.ticker_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.ticker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Core for DummyCore {
    fn set_event_sink(&self, sink: Arc<dyn CoreEvents>) {
        *self.shared.sink.lock().unwrap() = Some(sink);
    }

    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    fn pause(&self) -> CoreResult<()> {
        let mut st = self.shared.inner.lock().unwrap();
        match st.emu_state {
            EmuState::Stopped => Err(CoreError::InvalidState),
            _ => {
                st.emu_state = EmuState::Paused;
                Ok(())
            }
        }
    }

    fn resume(&self) -> CoreResult<()> {
        let mut st = self.shared.inner.lock().unwrap();
        match st.emu_state {
            EmuState::Stopped => Err(CoreError::InvalidState),
            _ => {
                st.emu_state = EmuState::Running;
                Ok(())
            }
        }
    }

    fn stop(&self) -> CoreResult<()> {
        self.shared.inner.lock().unwrap().emu_state = EmuState::Stopped;
        Ok(())
    }

    fn advance_frame(&self) -> CoreResult<()> {
        {
            let mut st = self.shared.inner.lock().unwrap();
            if st.emu_state == EmuState::Stopped {
                return Err(CoreError::InvalidState);
            }
            st.emu_state = EmuState::Paused;
        }
        self.shared.step_frame();
        Ok(())
    }

    fn emu_state(&self) -> CoreResult<EmuState> {
        Ok(self.shared.inner.lock().unwrap().emu_state)
    }

    fn video_size(&self) -> CoreResult<(u32, u32)> {
        Ok(self.shared.inner.lock().unwrap().video)
    }

    fn speed_factor(&self) -> CoreResult<i32> {
        Ok(self.shared.inner.lock().unwrap().speed_factor)
    }

    fn set_speed_factor(&self, percent: i32) -> CoreResult<()> {
        if percent <= 0 {
            return Err(CoreError::InputInvalid);
        }
        self.shared.inner.lock().unwrap().speed_factor = percent;
        Ok(())
    }

    fn speed_limiter(&self) -> CoreResult<bool> {
        Ok(self.shared.inner.lock().unwrap().speed_limiter)
    }

    fn set_speed_limiter(&self, enabled: bool) -> CoreResult<()> {
        self.shared.inner.lock().unwrap().speed_limiter = enabled;
        Ok(())
    }

    fn state_slot(&self) -> CoreResult<i32> {
        Ok(self.shared.inner.lock().unwrap().state_slot)
    }

    fn set_state_slot(&self, slot: i32) -> CoreResult<()> {
        if !(0..=9).contains(&slot) {
            return Err(CoreError::InputInvalid);
        }
        self.shared.inner.lock().unwrap().state_slot = slot;
        Ok(())
    }

    fn save_state(&self, path: Option<&str>, format: i32) -> CoreResult<()> {
        let mut st = self.shared.inner.lock().unwrap();
        if st.emu_state == EmuState::Stopped {
            return Err(CoreError::InvalidState);
        }
        let value = if std::mem::take(&mut st.fail_next_save) { 0 } else { 1 };
        st.last_save = Some(SaveRequest {
            path: path.map(str::to_owned),
            format,
        });
        st.pending.push((CoreEvent::StateSaveComplete, value));
        Ok(())
    }

    fn load_state(&self, _path: Option<&str>) -> CoreResult<()> {
        let mut st = self.shared.inner.lock().unwrap();
        if st.emu_state == EmuState::Stopped {
            return Err(CoreError::InvalidState);
        }
        let value = if std::mem::take(&mut st.fail_next_load) { 0 } else { 1 };
        st.pending.push((CoreEvent::StateLoadComplete, value));
        Ok(())
    }

    fn take_screenshot(&self) -> CoreResult<()> {
        let mut st = self.shared.inner.lock().unwrap();
        if st.emu_state == EmuState::Stopped {
            return Err(CoreError::InvalidState);
        }
        st.pending.push((CoreEvent::ScreenshotCaptured, 1));
        Ok(())
    }

    fn set_input(&self, port: usize, state: u32) -> CoreResult<()> {
        if port >= 4 {
            return Err(CoreError::InputInvalid);
        }
        self.shared.inner.lock().unwrap().inputs[port] = state;
        Ok(())
    }

    fn queue_input(&self, queued: QueuedInput) -> CoreResult<()> {
        if queued.port >= 4 || queued.last_frame < queued.first_frame {
            return Err(CoreError::InputInvalid);
        }
        self.shared.inner.lock().unwrap().queued.push(queued);
        Ok(())
    }

    fn clear_input(&self, port: Option<usize>) -> CoreResult<()> {
        let mut st = self.shared.inner.lock().unwrap();
        match port {
            None => {
                st.inputs = [0; 4];
                st.queued.clear();
            }
            Some(p) if p < 4 => {
                st.inputs[p] = 0;
                st.queued.retain(|q| q.port != p);
            }
            Some(_) => return Err(CoreError::InputInvalid),
        }
        Ok(())
    }

    fn read_screen(&self, _front: bool, buf: &mut [u8]) -> CoreResult<()> {
        let (w, h) = self.shared.inner.lock().unwrap().video;
        let needed = w as usize * h as usize * 3;
        if buf.len() < needed {
            return Err(CoreError::InputAssert);
        }
        // deterministic gradient so capture tests can predict exact pixels
        for y in 0..h as usize {
            for x in 0..w as usize {
                let idx = (y * w as usize + x) * 3;
                buf[idx] = (x & 0xff) as u8;
                buf[idx + 1] = (y & 0xff) as u8;
                buf[idx + 2] = ((x ^ y) & 0xff) as u8;
            }
        }
        Ok(())
    }

    fn read_depth(&self, _front: bool, buf: &mut [u16]) -> CoreResult<()> {
        if !self.depth_supported {
            return Err(CoreError::Unsupported);
        }
        let (w, h) = self.shared.inner.lock().unwrap().video;
        let needed = w as usize * h as usize;
        if buf.len() < needed {
            return Err(CoreError::InputAssert);
        }
        for y in 0..h as usize {
            for x in 0..w as usize {
                buf[y * w as usize + x] = ((y * w as usize + x) & 0xffff) as u16;
            }
        }
        Ok(())
    }

    fn mem_read(&self, addr: u32, width: MemWidth) -> CoreResult<u64> {
        let st = self.shared.inner.lock().unwrap();
        Ok(st.memory.get(&addr).copied().unwrap_or(0) & width.mask())
    }

    fn mem_write(&self, addr: u32, width: MemWidth, value: u64) -> CoreResult<()> {
        let mut st = self.shared.inner.lock().unwrap();
        st.memory.insert(addr, value & width.mask());
        Ok(())
    }
}

// ── tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingSink {
        frames: AtomicU32,
        saves: AtomicU32,
    }

    impl CoreEvents for CountingSink {
        fn state_changed(&self, event: CoreEvent, _value: i32) {
            if event == CoreEvent::StateSaveComplete {
                self.saves.fetch_add(1, Ordering::SeqCst);
            }
        }
        fn frame(&self, _index: u32) {
            self.frames.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn completions_fire_only_on_frame_advance() {
        let core = DummyCore::new();
        core.pause().unwrap();
        let sink = Arc::new(CountingSink {
            frames: AtomicU32::new(0),
            saves: AtomicU32::new(0),
        });
        core.set_event_sink(sink.clone());

        core.save_state(None, 0).unwrap();
        // paused, no frame advanced yet: the completion must not have fired
        assert_eq!(sink.saves.load(Ordering::SeqCst), 0);

        core.advance_frame().unwrap();
        assert_eq!(sink.saves.load(Ordering::SeqCst), 1);
        assert!(sink.frames.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn advance_frame_steps_exactly_one_frame_when_paused() {
        let core = DummyCore::new();
        core.pause().unwrap();
        let before = core.frame();
        core.advance_frame().unwrap();
        assert_eq!(core.frame(), before + 1);
    }

    #[test]
    fn frames_tick_while_running() {
        let core = DummyCore::new();
        let before = core.frame();
        std::thread::sleep(Duration::from_millis(50));
        assert!(core.frame() > before);
    }

    #[test]
    fn mem_roundtrip_masks_to_width() {
        let core = DummyCore::new();
        core.mem_write(0x8000_0000, MemWidth::W8, 0x1ff).unwrap();
        assert_eq!(core.mem_read(0x8000_0000, MemWidth::W8).unwrap(), 0xff);
        assert_eq!(core.mem_read(0x8000_0004, MemWidth::W32).unwrap(), 0);
    }

    #[test]
    fn stopped_core_rejects_transport_commands() {
        let core = DummyCore::new();
        core.stop().unwrap();
        assert_eq!(core.pause(), Err(CoreError::InvalidState));
        assert_eq!(core.advance_frame(), Err(CoreError::InvalidState));
        assert_eq!(core.save_state(None, 0), Err(CoreError::InvalidState));
    }
}
