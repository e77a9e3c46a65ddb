// capture.rs — framebuffer and depth-buffer capture pipeline
//
// A capture is planned from the source video size plus either a named
// preset (per-mille coordinates) or explicit crop arguments, then executed
// as a nearest-neighbor downsample. Color goes out as a P6 PPM, depth as a
// raw little-endian u16 blob with optional 180° rotation.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use thiserror::Error;

use crate::presets::FramebufferPreset;

// ── plan ──────────────────────────────────────────────────────────────────────

/// Explicit crop arguments from the request. Absent fields default to the
/// full frame; `w`/`h` values of zero or less also mean "to the edge".
#[derive(Debug, Clone, Copy, Default)]
pub struct CropArgs {
    pub x: Option<i64>,
    pub y: Option<i64>,
    pub w: Option<i64>,
    pub h: Option<i64>,
    pub scale_div: Option<i64>,
}

/// Fully clamped capture geometry. Invariants after `plan`:
/// `crop_x < source_w`, `crop_y < source_h`, `crop_w, crop_h >= 1`,
/// `crop_x + crop_w <= source_w`, `crop_y + crop_h <= source_h`,
/// `out_w, out_h >= 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturePlan {
    pub source_w: u32,
    pub source_h: u32,
    pub crop_x: u32,
    pub crop_y: u32,
    pub crop_w: u32,
    pub crop_h: u32,
    pub scale_div: u32,
    pub out_w: u32,
    pub out_h: u32,
}

/// Derive the clamped capture geometry. Source dimensions must be
/// nonzero; the dispatcher rejects zero-sized video before planning.
pub fn plan(
    source_w: u32,
    source_h: u32,
    preset: Option<&FramebufferPreset>,
    args: &CropArgs,
) -> CapturePlan {
    let sw = i64::from(source_w);
    let sh = i64::from(source_h);

    let (mut x, mut y, mut w, mut h) = match preset {
        Some(p) => (
            sw * i64::from(p.x_milli) / 1000,
            sh * i64::from(p.y_milli) / 1000,
            sw * i64::from(p.w_milli) / 1000,
            sh * i64::from(p.h_milli) / 1000,
        ),
        None => (
            args.x.unwrap_or(0),
            args.y.unwrap_or(0),
            args.w.unwrap_or(0),
            args.h.unwrap_or(0),
        ),
    };

    x = x.clamp(0, sw - 1);
    y = y.clamp(0, sh - 1);
    if w <= 0 {
        w = sw - x;
    }
    if h <= 0 {
        h = sh - y;
    }
    w = w.min(sw - x).max(1);
    h = h.min(sh - y).max(1);

    let scale_div = args.scale_div.unwrap_or(1).max(1);
    let out_w = (w / scale_div).max(1);
    let out_h = (h / scale_div).max(1);

    CapturePlan {
        source_w,
        source_h,
        crop_x: x as u32,
        crop_y: y as u32,
        crop_w: w as u32,
        crop_h: h as u32,
        scale_div: scale_div as u32,
        out_w: out_w as u32,
        out_h: out_h as u32,
    }
}

// ── downsampling ──────────────────────────────────────────────────────────────

fn src_coord(plan: &CapturePlan, x: u32, y: u32) -> (usize, usize) {
    let sx = (plan.crop_x + x * plan.scale_div).min(plan.source_w - 1);
    let sy = (plan.crop_y + y * plan.scale_div).min(plan.source_h - 1);
    (sx as usize, sy as usize)
}

/// Nearest-neighbor downsample of packed RGB triplets (row-major,
/// top-left origin). `src` must hold `source_w * source_h * 3` bytes.
pub fn downsample_rgb(src: &[u8], plan: &CapturePlan) -> Vec<u8> {
    let mut out = Vec::with_capacity(plan.out_w as usize * plan.out_h as usize * 3);
    for y in 0..plan.out_h {
        for x in 0..plan.out_w {
            let (sx, sy) = src_coord(plan, x, y);
            let idx = (sy * plan.source_w as usize + sx) * 3;
            out.extend_from_slice(&src[idx..idx + 3]);
        }
    }
    out
}

/// Downsample 16-bit depth values to little-endian bytes. With `rotate180`
/// the pixel written at (x, y) is read from the mirrored source position,
/// so applying the rotation twice reproduces the unrotated output.
pub fn downsample_depth(src: &[u16], plan: &CapturePlan, rotate180: bool) -> Vec<u8> {
    let out_w = plan.out_w as usize;
    let out_h = plan.out_h as usize;
    let mut out = vec![0u8; out_w * out_h * 2];
    for y in 0..plan.out_h {
        for x in 0..plan.out_w {
            let (sx, sy) = src_coord(plan, x, y);
            let z = src[sy * plan.source_w as usize + sx];
            let (dx, dy) = if rotate180 {
                (out_w - 1 - x as usize, out_h - 1 - y as usize)
            } else {
                (x as usize, y as usize)
            };
            let idx = (dy * out_w + dx) * 2;
            out[idx] = (z & 0xff) as u8;
            out[idx + 1] = (z >> 8) as u8;
        }
    }
    out
}

// ── writers ───────────────────────────────────────────────────────────────────

/// Output failure, split so the dispatcher can distinguish "couldn't open
/// the path" from "opened but couldn't write".
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open output path")]
    Open(#[source] io::Error),
    #[error("failed to write output")]
    Write(#[source] io::Error),
}

/// Write a binary PPM: `P6\n<w> <h>\n255\n` then raw triplets.
pub fn write_ppm(path: &Path, out_w: u32, out_h: u32, rgb: &[u8]) -> Result<(), CaptureError> {
    let mut file = File::create(path).map_err(CaptureError::Open)?;
    file.write_all(format!("P6\n{out_w} {out_h}\n255\n").as_bytes())
        .map_err(CaptureError::Write)?;
    file.write_all(rgb).map_err(CaptureError::Write)
}

/// Write a raw blob (depth output; no header).
pub fn write_raw(path: &Path, data: &[u8]) -> Result<(), CaptureError> {
    let mut file = File::create(path).map_err(CaptureError::Open)?;
    file.write_all(data).map_err(CaptureError::Write)
}

// ── tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presets;

    fn full(args: CropArgs) -> CapturePlan {
        plan(640, 480, None, &args)
    }

    #[test]
    fn defaults_cover_the_full_frame() {
        let p = full(CropArgs::default());
        assert_eq!((p.crop_x, p.crop_y, p.crop_w, p.crop_h), (0, 0, 640, 480));
        assert_eq!((p.out_w, p.out_h), (640, 480));
    }

    #[test]
    fn hud_preset_on_640x480_is_640x105() {
        let p = plan(640, 480, presets::find("hud"), &CropArgs::default());
        assert_eq!((p.crop_x, p.crop_y, p.crop_w, p.crop_h), (0, 0, 640, 105));
        assert_eq!((p.out_w, p.out_h), (640, 105));
    }

    #[test]
    fn action_command_preset_floors_per_mille() {
        let p = plan(640, 480, presets::find("action_command"), &CropArgs::default());
        // 640*260/1000=166, 480*360/1000=172, 640*480/1000=307, 480*260/1000=124
        assert_eq!((p.crop_x, p.crop_y, p.crop_w, p.crop_h), (166, 172, 307, 124));
    }

    #[test]
    fn crop_is_clamped_into_the_frame() {
        let p = full(CropArgs {
            x: Some(-50),
            y: Some(600),
            w: Some(10_000),
            h: Some(10_000),
            scale_div: None,
        });
        assert_eq!((p.crop_x, p.crop_y), (0, 479));
        assert_eq!((p.crop_w, p.crop_h), (640, 1));
    }

    #[test]
    fn scale_div_shrinks_output_with_floor_one() {
        let p = full(CropArgs {
            scale_div: Some(4),
            ..CropArgs::default()
        });
        assert_eq!((p.out_w, p.out_h), (160, 120));

        let tiny = plan(
            640,
            480,
            None,
            &CropArgs {
                w: Some(3),
                h: Some(3),
                scale_div: Some(100),
                ..CropArgs::default()
            },
        );
        assert_eq!((tiny.out_w, tiny.out_h), (1, 1));
    }

    fn gradient_rgb(w: usize, h: usize) -> Vec<u8> {
        let mut v = Vec::with_capacity(w * h * 3);
        for y in 0..h {
            for x in 0..w {
                v.extend_from_slice(&[x as u8, y as u8, (x ^ y) as u8]);
            }
        }
        v
    }

    #[test]
    fn downsample_picks_the_top_left_sample() {
        let src = gradient_rgb(8, 8);
        let p = plan(
            8,
            8,
            None,
            &CropArgs {
                x: Some(2),
                y: Some(2),
                w: Some(4),
                h: Some(4),
                scale_div: Some(2),
                ..CropArgs::default()
            },
        );
        assert_eq!((p.out_w, p.out_h), (2, 2));
        let out = downsample_rgb(&src, &p);
        // output (0,0) samples source (2,2); (1,1) samples (4,4)
        assert_eq!(&out[0..3], &[2, 2, 0]);
        assert_eq!(&out[9..12], &[4, 4, 0]);
    }

    #[test]
    fn depth_rotation_is_involutive() {
        let src: Vec<u16> = (0..64).collect();
        let p = plan(8, 8, None, &CropArgs::default());
        let plain = downsample_depth(&src, &p, false);
        let once = downsample_depth(&src, &p, true);
        assert_ne!(plain, once);

        // rotating the rotated pixels again restores the original layout
        let rotated: Vec<u16> = once
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        let twice = downsample_depth(&rotated, &p, true);
        assert_eq!(plain, twice);
    }

    #[test]
    fn depth_bytes_are_little_endian() {
        let src = vec![0xabcdu16];
        let p = plan(1, 1, None, &CropArgs::default());
        assert_eq!(downsample_depth(&src, &p, false), vec![0xcd, 0xab]);
    }

    #[test]
    fn ppm_file_has_exact_header_and_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.ppm");
        write_ppm(&path, 2, 1, &[1, 2, 3, 4, 5, 6]).unwrap();
        let data = std::fs::read(&path).unwrap();
        assert_eq!(&data[..], b"P6\n2 1\n255\n\x01\x02\x03\x04\x05\x06");
    }

    #[test]
    fn unwritable_path_reports_open_failure() {
        let err = write_ppm(Path::new("/nonexistent-dir/x.ppm"), 1, 1, &[0; 3]).unwrap_err();
        assert!(matches!(err, CaptureError::Open(_)));
    }
}
