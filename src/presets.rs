// presets.rs — named framebuffer crop regions
//
// Regions are expressed in per-mille of the current video size so the same
// preset works at any resolution. The table is static; lookup is
// case-insensitive.

use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct FramebufferPreset {
    pub name: &'static str,
    pub x_milli: u32,
    pub y_milli: u32,
    pub w_milli: u32,
    pub h_milli: u32,
    pub description: &'static str,
}

pub const PRESETS: &[FramebufferPreset] = &[
    FramebufferPreset {
        name: "full",
        x_milli: 0,
        y_milli: 0,
        w_milli: 1000,
        h_milli: 1000,
        description: "full frame",
    },
    FramebufferPreset {
        name: "hud",
        x_milli: 0,
        y_milli: 0,
        w_milli: 1000,
        h_milli: 220,
        description: "top HUD band",
    },
    FramebufferPreset {
        name: "dialog",
        x_milli: 0,
        y_milli: 620,
        w_milli: 1000,
        h_milli: 380,
        description: "bottom dialog area",
    },
    FramebufferPreset {
        name: "battle_ui",
        x_milli: 0,
        y_milli: 470,
        w_milli: 1000,
        h_milli: 530,
        description: "battle command UI area",
    },
    FramebufferPreset {
        name: "action_command",
        x_milli: 260,
        y_milli: 360,
        w_milli: 480,
        h_milli: 260,
        description: "timing / action-command focus region",
    },
];

pub fn find(name: &str) -> Option<&'static FramebufferPreset> {
    PRESETS.iter().find(|p| p.name.eq_ignore_ascii_case(name))
}

// ── tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        assert_eq!(find("hud").unwrap().h_milli, 220);
        assert_eq!(find("HUD").unwrap().h_milli, 220);
        assert!(find("no_such_region").is_none());
    }

    #[test]
    fn regions_stay_inside_the_frame() {
        for p in PRESETS {
            assert!(p.x_milli < 1000, "{}", p.name);
            assert!(p.y_milli < 1000, "{}", p.name);
            assert!((1..=1000).contains(&p.w_milli), "{}", p.name);
            assert!((1..=1000).contains(&p.h_milli), "{}", p.name);
            assert!(p.x_milli + p.w_milli <= 1000, "{}", p.name);
            assert!(p.y_milli + p.h_milli <= 1000, "{}", p.name);
        }
    }

    #[test]
    fn listing_serializes_with_per_mille_fields() {
        let json = serde_json::to_value(PRESETS).unwrap();
        let hud = &json.as_array().unwrap()[1];
        assert_eq!(hud["name"], "hud");
        assert_eq!(hud["h_milli"], 220);
    }
}
