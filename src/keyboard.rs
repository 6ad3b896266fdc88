//! Host keyboard layout, modifier map and controls for the guest keyboard

use tracing::error;

use crate::error::{Error, Result};
use crate::host::HostConnection;

/// Entries in a per-keycode table
pub const MAP_LENGTH: usize = 256;

/// Shift, Lock, Control, Mod1..Mod5
pub const NUM_MODIFIERS: usize = 8;

/// Keysyms for every keycode in `min_keycode..=max_keycode`, `map_width`
/// per keycode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySymTable {
    pub min_keycode: u8,
    pub max_keycode: u8,
    pub map_width: u8,
    pub map: Vec<u32>,
}

impl KeySymTable {
    pub fn keysyms(&self, keycode: u8) -> Option<&[u32]> {
        if keycode < self.min_keycode || keycode > self.max_keycode {
            return None;
        }
        let width = usize::from(self.map_width);
        let start = usize::from(keycode - self.min_keycode) * width;
        self.map.get(start..start + width)
    }
}

/// Modifier bits held by each keycode
#[derive(Clone, PartialEq, Eq)]
pub struct ModifierMap([u8; MAP_LENGTH]);

impl Default for ModifierMap {
    fn default() -> Self {
        Self([0; MAP_LENGTH])
    }
}

impl std::fmt::Debug for ModifierMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(
                self.0
                    .iter()
                    .enumerate()
                    .filter(|(_, bits)| **bits != 0)
                    .map(|(keycode, bits)| (keycode, format!("{:#010b}", bits))),
            )
            .finish()
    }
}

impl ModifierMap {
    pub fn get(&self, keycode: u8) -> u8 {
        self.0[usize::from(keycode)]
    }

    pub fn as_bytes(&self) -> &[u8; MAP_LENGTH] {
        &self.0
    }
}

/// Builds the per-keycode modifier table from a GetModifierMapping reply:
/// `keycodes` holds `keycodes_per_modifier` slots for each of the eight
/// modifiers. Zero slots are unused.
pub fn build_modifier_map(keycodes_per_modifier: usize, keycodes: &[u8]) -> ModifierMap {
    let mut map = ModifierMap::default();
    if keycodes_per_modifier == 0 {
        return map;
    }

    for (modifier, slots) in keycodes
        .chunks(keycodes_per_modifier)
        .take(NUM_MODIFIERS)
        .enumerate()
    {
        for &keycode in slots.iter().filter(|&&keycode| keycode != 0) {
            map.0[usize::from(keycode)] |= 1 << modifier;
        }
    }
    map
}

/// Core protocol keyboard control (auto repeat, bell, click, LEDs)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreKeyboardControl {
    pub global_auto_repeat: bool,
    pub auto_repeats: [u8; 32],
    pub led_mask: u32,
    pub key_click_percent: u8,
    pub bell_percent: u8,
    pub bell_pitch: u16,
    pub bell_duration: u16,
}

/// XKB controls of the host's core keyboard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XkbControls {
    pub device_id: u8,
    pub num_groups: u8,
    pub repeat_delay: u16,
    pub repeat_interval: u16,
    pub slow_keys_delay: u16,
    pub debounce_delay: u16,
    pub mouse_keys_default_button: u8,
    pub mouse_keys_delay: u16,
    pub mouse_keys_interval: u16,
    pub mouse_keys_time_to_max: u16,
    pub mouse_keys_max_speed: u16,
    pub mouse_keys_curve: i16,
    pub access_x_timeout: u16,
    pub enabled_controls: u32,
    pub per_key_repeat: [u8; 32],
}

/// Name of the host keyboard's XKB geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XkbGeometry {
    pub name: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyboardControls {
    pub xkb: XkbControls,
    pub core: CoreKeyboardControl,
    pub geometry: XkbGeometry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyboardMappings {
    pub keysyms: KeySymTable,
    pub modifiers: ModifierMap,
    pub controls: KeyboardControls,
}

/// Reads the host keyboard so the guest keyboard can mirror it.
pub fn keyboard_mappings<H: HostConnection + ?Sized>(host: &H) -> Result<KeyboardMappings> {
    let setup = host.setup();
    let (min_keycode, max_keycode) = (setup.min_keycode, setup.max_keycode);
    let count = max_keycode
        .checked_sub(min_keycode)
        .and_then(|span| span.checked_add(1))
        .ok_or_else(|| {
            Error::Protocol(format!(
                "bad keycode range {}..={}",
                min_keycode, max_keycode
            ))
        })?;

    let mapping = host.keyboard_mapping(min_keycode, count)?;
    let keysyms = KeySymTable {
        min_keycode,
        max_keycode,
        map_width: mapping.keysyms_per_keycode,
        map: mapping.keysyms,
    };

    let keycodes = host.modifier_mapping()?;
    let modifiers = build_modifier_map(keycodes.len() / NUM_MODIFIERS, &keycodes);

    let Some(geometry) = host.xkb_geometry()? else {
        error!("Couldn't get XKB keyboard");
        return Err(Error::Capability("XKB keyboard geometry".into()));
    };
    let Some(xkb) = host.xkb_controls()? else {
        error!("Couldn't get XKB keyboard controls");
        return Err(Error::Capability("XKB keyboard controls".into()));
    };
    let core = host.keyboard_control()?;

    Ok(KeyboardMappings {
        keysyms,
        modifiers,
        controls: KeyboardControls {
            xkb,
            core,
            geometry,
        },
    })
}
