// dispatch.rs — maps request lines to core actions and builds responses
//
// Dispatch is by exact match on `cmd`. Argument decoding is strict: a
// missing required field produces an error without touching the core.
// Every request yields exactly one response carrying the request's id
// (0 when absent). The dispatcher itself is stateless across requests;
// everything shared lives in the input shadow and the completion board.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::capture::{self, CaptureError, CropArgs};
use crate::codec::{self, RequestLine, Response};
use crate::completion::{CompletionBoard, WaitOutcome, COMPLETION_TIMEOUT};
use crate::core::{Core, CoreError, CoreEvent, EmuState, MemWidth, QueuedInput};
use crate::input::{self, InputShadow};
use crate::presets;

/// What the session loop should do after sending the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    Continue,
    /// Close this session (successful `shutdown`).
    Terminate,
}

type CmdResult = Result<Option<Value>, String>;

fn core_err(e: CoreError) -> String {
    format!("core command failed ({})", e.code())
}

pub struct Dispatcher {
    core: Arc<dyn Core>,
    shadow: Arc<InputShadow>,
    board: Arc<CompletionBoard>,
    stop: Arc<AtomicBool>,
    completion_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        core: Arc<dyn Core>,
        shadow: Arc<InputShadow>,
        board: Arc<CompletionBoard>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            core,
            shadow,
            board,
            stop,
            completion_timeout: COMPLETION_TIMEOUT,
        }
    }

    /// Shorten the completion wait; the tests use this to keep timeout
    /// paths fast.
    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = timeout;
        self
    }

    // ── entry point ───────────────────────────────────────────────────────────

    pub fn handle(&self, line: &RequestLine) -> (Response, SessionAction) {
        let id = codec::get_int(&line.text, "id").unwrap_or(0);

        if line.truncated {
            return (
                Response::err(id, "request line too long"),
                SessionAction::Continue,
            );
        }
        let Some(cmd) = codec::get_str(&line.text, "cmd") else {
            return (Response::err(id, "missing cmd"), SessionAction::Continue);
        };

        let text = line.text.as_str();
        let mut action = SessionAction::Continue;
        let result = match cmd.as_str() {
            "status" => self.status(),
            "framebuffer_presets" => Ok(Some(json!({ "presets": presets::PRESETS }))),
            "pause" => self.core.pause().map(|()| None).map_err(core_err),
            "resume" => self.core.resume().map(|()| None).map_err(core_err),
            "stop" => self.core.stop().map(|()| None).map_err(core_err),
            "step_frames" => self.step_frames(text),
            "set_speed_limiter" => self.set_speed_limiter(text),
            "set_speed_factor" => self.set_speed_factor(text),
            "set_state_slot" => self.set_state_slot(text),
            "save_state" => self.save_state(text),
            "load_state" => self.load_state(text),
            "screenshot" => self.screenshot(),
            "framebuffer_dump" => self.framebuffer_dump(text, false),
            "framebuffer_dump_preset" => self.framebuffer_dump(text, true),
            "depth_dump" => self.depth_dump(text),
            "input_set" => self.input_set(text),
            "input_queue" => self.input_queue(text),
            "input_press" => self.input_press_release(text, true),
            "input_release" => self.input_press_release(text, false),
            "input_stick" => self.input_stick(text),
            "input_tap" | "input_hold" => self.input_tap(text),
            "input_get" => self.input_get(text),
            "input_clear" => self.input_clear(text),
            "mem_read" => self.mem_read(text),
            "mem_write" => self.mem_write(text),
            "shutdown" => {
                let result = self.shutdown();
                if result.is_ok() {
                    action = SessionAction::Terminate;
                }
                result
            }
            _ => Err("unknown command".into()),
        };

        let response = match result {
            Ok(body) => Response { id, body: Ok(body) },
            Err(error) => Response::err(id, error),
        };
        (response, action)
    }

    // ── argument helpers ──────────────────────────────────────────────────────

    fn require_port(&self, line: &str) -> Result<usize, String> {
        codec::get_int(line, "port")
            .and_then(input::normalize_port)
            .ok_or_else(|| "missing or invalid port (use 1-4)".to_owned())
    }

    fn require_button(&self, line: &str) -> Result<u32, String> {
        let name = codec::get_str(line, "button").ok_or("missing button")?;
        input::button_mask(&name).ok_or_else(|| "unknown button".to_owned())
    }

    fn video_size(&self) -> Result<(u32, u32), String> {
        let (w, h) = self
            .core
            .video_size()
            .map_err(|_| "failed to query video size".to_owned())?;
        if w == 0 || h == 0 {
            return Err("invalid video size".into());
        }
        Ok((w, h))
    }

    // ── status / presets ──────────────────────────────────────────────────────

    fn status(&self) -> CmdResult {
        let emu_state = self.core.emu_state().map_err(core_err)?;
        let speed_factor = self.core.speed_factor().map_err(core_err)?;
        let speed_limiter = self.core.speed_limiter().map_err(core_err)?;
        let state_slot = self.core.state_slot().map_err(core_err)?;
        let (width, height) = self.core.video_size().map_err(core_err)?;
        Ok(Some(json!({
            "emu_state": emu_state.code(),
            "frame": self.board.last_frame(),
            "speed_factor": speed_factor,
            "speed_limiter": speed_limiter,
            "state_slot": state_slot,
            "video_width": width,
            "video_height": height,
            "input_shadow": self.shadow.snapshot(),
            "state_load_last": self.board.cell(CoreEvent::StateLoadComplete).last_result,
            "state_save_last": self.board.cell(CoreEvent::StateSaveComplete).last_result,
            "screenshot_last": self.board.cell(CoreEvent::ScreenshotCaptured).last_result,
        })))
    }

    // ── emulation control ─────────────────────────────────────────────────────

    fn step_frames(&self, line: &str) -> CmdResult {
        let count = codec::get_int(line, "count").unwrap_or(1).clamp(1, 10_000);

        let emu_state = self
            .core
            .emu_state()
            .map_err(|_| "failed to query emulation state".to_owned())?;
        if emu_state != EmuState::Paused {
            return Err("step_frames requires paused state; call pause first".into());
        }

        for _ in 0..count {
            let frame_before = self.board.last_frame();
            self.core.advance_frame().map_err(core_err)?;
            if !self
                .board
                .wait_frame_advance(frame_before, self.completion_timeout, &self.stop)
            {
                return Err(core_err(CoreError::SystemFail));
            }
        }

        Ok(Some(json!({
            "advanced": count,
            "frame": self.board.last_frame(),
        })))
    }

    fn set_speed_limiter(&self, line: &str) -> CmdResult {
        let enabled = codec::get_bool(line, "enabled").ok_or("missing enabled")?;
        self.core
            .set_speed_limiter(enabled)
            .map(|()| None)
            .map_err(core_err)
    }

    fn set_speed_factor(&self, line: &str) -> CmdResult {
        let value = codec::get_int(line, "value").ok_or("missing value")?;
        self.core
            .set_speed_factor(value as i32)
            .map(|()| None)
            .map_err(core_err)
    }

    fn set_state_slot(&self, line: &str) -> CmdResult {
        let slot = codec::get_int(line, "slot").ok_or("missing slot")?;
        self.core
            .set_state_slot(slot as i32)
            .map(|()| None)
            .map_err(core_err)
    }

    // ── completion-waiting commands ───────────────────────────────────────────

    fn await_completion(&self, event: CoreEvent, previous: u32, op: &str) -> CmdResult {
        match self.board.wait_completion(
            event,
            previous,
            self.completion_timeout,
            self.core.as_ref(),
            &self.stop,
        ) {
            WaitOutcome::Completed(0) => Err(format!("{op} failed")),
            WaitOutcome::Completed(_) => Ok(None),
            WaitOutcome::TimedOut | WaitOutcome::Stopped => Err(format!("{op} timed out")),
        }
    }

    fn save_state(&self, line: &str) -> CmdResult {
        let previous = self.board.cell(CoreEvent::StateSaveComplete).seq;
        let result = match codec::get_str(line, "path") {
            Some(path) => {
                let format = codec::get_int(line, "format").unwrap_or(2);
                self.core.save_state(Some(&path), format as i32)
            }
            None => self.core.save_state(None, 0),
        };
        result.map_err(core_err)?;
        self.await_completion(CoreEvent::StateSaveComplete, previous, "save_state")
    }

    fn load_state(&self, line: &str) -> CmdResult {
        let previous = self.board.cell(CoreEvent::StateLoadComplete).seq;
        let path = codec::get_str(line, "path");
        self.core.load_state(path.as_deref()).map_err(core_err)?;
        self.await_completion(CoreEvent::StateLoadComplete, previous, "load_state")
    }

    fn screenshot(&self) -> CmdResult {
        let previous = self.board.cell(CoreEvent::ScreenshotCaptured).seq;
        self.core.take_screenshot().map_err(core_err)?;
        self.await_completion(CoreEvent::ScreenshotCaptured, previous, "screenshot")
    }

    // ── capture ───────────────────────────────────────────────────────────────

    fn crop_args(line: &str) -> CropArgs {
        CropArgs {
            x: codec::get_int(line, "crop_x"),
            y: codec::get_int(line, "crop_y"),
            w: codec::get_int(line, "crop_w"),
            h: codec::get_int(line, "crop_h"),
            scale_div: codec::get_int(line, "scale_div"),
        }
    }

    fn alloc_buffer<T: Clone + Default>(len: usize) -> Result<Vec<T>, String> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(len).map_err(|_| "out of memory".to_owned())?;
        buf.resize(len, T::default());
        Ok(buf)
    }

    fn framebuffer_dump(&self, line: &str, with_preset: bool) -> CmdResult {
        let path = codec::get_str(line, "path").ok_or("missing path")?;
        let front = codec::get_bool(line, "front").unwrap_or(false);

        let preset = if with_preset {
            let name = codec::get_str(line, "preset").ok_or("missing preset")?;
            Some(presets::find(&name).ok_or("unknown preset")?)
        } else {
            None
        };

        let (width, height) = self.video_size()?;
        let plan = capture::plan(width, height, preset, &Self::crop_args(line));

        let mut rgb: Vec<u8> = Self::alloc_buffer(width as usize * height as usize * 3)?;
        self.core
            .read_screen(front, &mut rgb)
            .map_err(|_| "read_screen failed".to_owned())?;

        let out = capture::downsample_rgb(&rgb, &plan);
        capture::write_ppm(std::path::Path::new(&path), plan.out_w, plan.out_h, &out).map_err(
            |e| match e {
                CaptureError::Open(_) => "failed to open output path".to_owned(),
                CaptureError::Write(_) => "failed to write framebuffer".to_owned(),
            },
        )?;

        let mut result = json!({
            "path": path,
            "source_width": plan.source_w,
            "source_height": plan.source_h,
            "crop_x": plan.crop_x,
            "crop_y": plan.crop_y,
            "crop_w": plan.crop_w,
            "crop_h": plan.crop_h,
            "width": plan.out_w,
            "height": plan.out_h,
            "scale_div": plan.scale_div,
        });
        if let Some(p) = preset {
            result["preset"] = json!(p.name);
        }
        Ok(Some(result))
    }

    fn depth_dump(&self, line: &str) -> CmdResult {
        let path = codec::get_str(line, "path").ok_or("missing path")?;
        let front = codec::get_bool(line, "front").unwrap_or(false);
        let rotate180 = codec::get_bool(line, "rotate180").unwrap_or(false);

        let (width, height) = self.video_size()?;
        let plan = capture::plan(width, height, None, &Self::crop_args(line));

        let mut depth: Vec<u16> = Self::alloc_buffer(width as usize * height as usize)?;
        self.core.read_depth(front, &mut depth).map_err(|e| match e {
            CoreError::Unsupported => "depth read is not supported by this video plugin".to_owned(),
            _ => "read_screen_depth failed".to_owned(),
        })?;

        let out = capture::downsample_depth(&depth, &plan, rotate180);
        capture::write_raw(std::path::Path::new(&path), &out).map_err(|e| match e {
            CaptureError::Open(_) => "failed to open output path".to_owned(),
            CaptureError::Write(_) => "failed to write depth buffer".to_owned(),
        })?;

        Ok(Some(json!({
            "path": path,
            "format": "u16le",
            "source_width": plan.source_w,
            "source_height": plan.source_h,
            "crop_x": plan.crop_x,
            "crop_y": plan.crop_y,
            "crop_w": plan.crop_w,
            "crop_h": plan.crop_h,
            "width": plan.out_w,
            "height": plan.out_h,
            "scale_div": plan.scale_div,
            "rotate180": if rotate180 { 1 } else { 0 },
        })))
    }

    // ── input ─────────────────────────────────────────────────────────────────

    fn input_set(&self, line: &str) -> CmdResult {
        let port = self.require_port(line)?;
        let state = codec::get_u32(line, "input").ok_or("missing input value")?;
        self.shadow.set(port, state);
        self.core
            .set_input(port, state)
            .map(|()| None)
            .map_err(core_err)
    }

    fn input_queue(&self, line: &str) -> CmdResult {
        let port = self.require_port(line)?;
        let state = codec::get_u32(line, "input").ok_or("missing input value")?;
        let first_frame = codec::get_u32(line, "start_frame").ok_or("missing start_frame")?;
        let last_frame = codec::get_u32(line, "end_frame").ok_or("missing end_frame")?;
        // queued windows deliberately bypass the shadow: they expire on
        // their own and must not fight later shadow-based commands
        self.core
            .queue_input(QueuedInput {
                port,
                input: state,
                first_frame,
                last_frame,
            })
            .map(|()| None)
            .map_err(core_err)
    }

    fn input_press_release(&self, line: &str, press: bool) -> CmdResult {
        let port = self.require_port(line)?;
        let mask = self.require_button(line)?;
        let state = if press {
            self.shadow.press(port, mask)
        } else {
            self.shadow.release(port, mask)
        };
        self.core
            .set_input(port, state)
            .map(|()| None)
            .map_err(core_err)
    }

    fn input_stick(&self, line: &str) -> CmdResult {
        let port = self.require_port(line)?;
        let (Some(x), Some(y)) = (codec::get_int(line, "x"), codec::get_int(line, "y")) else {
            return Err("missing x/y".into());
        };
        let state = self.shadow.set_stick(port, x, y);
        self.core
            .set_input(port, state)
            .map(|()| None)
            .map_err(core_err)
    }

    fn input_tap(&self, line: &str) -> CmdResult {
        let port = self.require_port(line)?;
        let mask = self.require_button(line)?;
        let frames = codec::get_int(line, "frames").unwrap_or(1).max(1) as u32;
        let frame_now = self.board.last_frame();

        let base = self.shadow.get(port);
        let hold = QueuedInput {
            port,
            input: base | mask,
            first_frame: frame_now + 1,
            last_frame: frame_now + frames,
        };
        let release = QueuedInput {
            port,
            input: base & !mask,
            first_frame: hold.last_frame + 1,
            last_frame: hold.last_frame + 1,
        };
        self.core.queue_input(hold).map_err(core_err)?;
        self.core.queue_input(release).map_err(core_err)?;
        Ok(None)
    }

    fn input_get(&self, line: &str) -> CmdResult {
        let port = self.require_port(line)?;
        Ok(Some(json!({
            "port": port + 1,
            "input": self.shadow.get(port),
        })))
    }

    fn input_clear(&self, line: &str) -> CmdResult {
        let port = match codec::get_int(line, "port") {
            None => None,
            Some(raw) => Some(
                input::normalize_port(raw).ok_or_else(|| "invalid port (use 1-4)".to_owned())?,
            ),
        };
        self.shadow.clear(port);
        self.core.clear_input(port).map(|()| None).map_err(core_err)
    }

    // ── debugger memory ───────────────────────────────────────────────────────

    fn require_paused(&self, op: &str) -> Result<(), String> {
        match self.core.emu_state() {
            Ok(EmuState::Paused) => Ok(()),
            _ => Err(format!("{op} requires paused state")),
        }
    }

    fn require_width(line: &str) -> Result<MemWidth, String> {
        MemWidth::from_bits(codec::get_int(line, "bits").unwrap_or(32))
            .ok_or_else(|| "unsupported bits value (use 8,16,32,64)".to_owned())
    }

    fn mem_read(&self, line: &str) -> CmdResult {
        if !self.core.capabilities().debugger {
            return Err("debugger capability is required for mem_read".into());
        }
        let addr = codec::get_u32(line, "addr").ok_or("missing addr")?;
        let width = Self::require_width(line)?;
        self.require_paused("mem_read")?;

        let value = self.core.mem_read(addr, width).map_err(core_err)?;
        Ok(Some(json!({
            "addr": addr,
            "bits": width.bits(),
            "value": value,
        })))
    }

    fn mem_write(&self, line: &str) -> CmdResult {
        if !self.core.capabilities().debugger {
            return Err("debugger capability is required for mem_write".into());
        }
        let addr = codec::get_u32(line, "addr").ok_or("missing addr")?;
        let value = codec::get_u32(line, "value").ok_or("missing value")?;
        let width = Self::require_width(line)?;
        self.require_paused("mem_write")?;

        self.core
            .mem_write(addr, width, u64::from(value))
            .map(|()| None)
            .map_err(core_err)
    }

    // ── shutdown ──────────────────────────────────────────────────────────────

    fn shutdown(&self) -> CmdResult {
        let result = self.core.stop();
        // the server winds down even when the core refuses to stop
        self.stop.store(true, Ordering::SeqCst);
        result.map(|()| None).map_err(core_err)
    }
}

// ── tests ─────────────────────────────────────────────────────────────────────
