//! Numeric encodings used by the gateway.
//!
//! The gateway light is driven by a single packed integer: the top byte holds
//! the brightness percentage and the low 24 bits a plain `0xRRGGBB` colour.
//! Sensor readings arrive as fixed-point strings with two implied decimals.

use crate::error::{GatewayError, Result};

const BRIGHTNESS_SHIFT: u32 = 65536 * 256;

/// A packed gateway colour split into its parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedColor {
    /// Brightness in percent (0..=100 in practice)
    pub brightness: u8,
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl PackedColor {
    /// The 24-bit `0xRRGGBB` part of the colour.
    pub fn rgb(&self) -> u32 {
        65536 * self.red as u32 + 256 * self.green as u32 + self.blue as u32
    }
}

/// Hue/saturation/brightness triple as used by the host's colour items.
///
/// `hue` is in degrees (0..360), `saturation` and `brightness` in percent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hsb {
    pub hue: f64,
    pub saturation: f64,
    pub brightness: f64,
}

impl Hsb {
    pub fn new(hue: f64, saturation: f64, brightness: f64) -> Self {
        Self {
            hue,
            saturation,
            brightness,
        }
    }

    /// Converts to 8-bit red, green and blue components.
    pub fn to_rgb(&self) -> (u8, u8, u8) {
        let s = (self.saturation / 100.0).clamp(0.0, 1.0);
        let v = (self.brightness / 100.0).clamp(0.0, 1.0);
        let channel = |x: f64| (x * 255.0 + 0.5) as u8;

        if s == 0.0 {
            let c = channel(v);
            return (c, c, c);
        }

        let h = (self.hue / 360.0).rem_euclid(1.0) * 6.0;
        let f = h - h.floor();
        let p = v * (1.0 - s);
        let q = v * (1.0 - s * f);
        let t = v * (1.0 - s * (1.0 - f));
        let (r, g, b) = match h as u8 {
            0 => (v, t, p),
            1 => (q, v, p),
            2 => (p, v, t),
            3 => (p, q, v),
            4 => (t, p, v),
            _ => (v, p, q),
        };
        (channel(r), channel(g), channel(b))
    }
}

/// Splits a packed value into brightness and colour.
pub fn decode_color(rgb_packed: u32) -> PackedColor {
    let brightness = rgb_packed / BRIGHTNESS_SHIFT;
    let rgb = rgb_packed - brightness * BRIGHTNESS_SHIFT;
    PackedColor {
        brightness: brightness as u8,
        red: ((rgb >> 16) & 0xFF) as u8,
        green: ((rgb >> 8) & 0xFF) as u8,
        blue: (rgb & 0xFF) as u8,
    }
}

/// Packs brightness and colour into the gateway's single integer.
pub fn encode_color(brightness: u8, red: u8, green: u8, blue: u8) -> u32 {
    BRIGHTNESS_SHIFT * brightness as u32 + 65536 * red as u32 + 256 * green as u32 + blue as u32
}

/// The value written when the light is switched on or off.
pub fn encode_color_from_on_off(on: bool, start_color: u32) -> u32 {
    if on { start_color } else { 0 }
}

/// Replaces the brightness byte of `current_rgb`, keeping its colour.
pub fn apply_brightness_delta(current_rgb: u32, brightness: u8) -> u32 {
    let color = decode_color(current_rgb);
    encode_color(brightness.min(100), color.red, color.green, color.blue)
}

/// Brightness percentage carried by a packed value.
pub fn brightness_of(rgb_packed: u32) -> u8 {
    decode_color(rgb_packed).brightness
}

/// Decodes a fixed-point sensor string (temperature, humidity, pressure).
///
/// A decimal point is inserted two characters before the end, so `"2362"`
/// becomes `23.62` and `"-462"` becomes `-4.62`. Single characters are parsed
/// as they are.
pub fn decode_htp_value(raw: &str) -> Result<f64> {
    let chars = raw.chars().count();
    let text = if chars > 1 {
        let split = raw
            .char_indices()
            .nth(chars - 2)
            .map(|(idx, _)| idx)
            .unwrap_or(0);
        format!("{}.{}", &raw[..split], &raw[split..])
    } else {
        raw.to_string()
    };

    text.parse::<f64>()
        .map_err(|_| GatewayError::Decode(format!("'{}' is not a sensor value", raw)))
}

/// Converts 8-bit RGB into hue (degrees), saturation and brightness (percent).
pub fn rgb_to_hsb(red: u8, green: u8, blue: u8) -> Hsb {
    let (r, g, b) = (red as f64, green as f64, blue as f64);
    let cmax = r.max(g).max(b);
    let cmin = r.min(g).min(b);

    let brightness = cmax / 255.0;
    let saturation = if cmax != 0.0 { (cmax - cmin) / cmax } else { 0.0 };

    let hue = if saturation == 0.0 {
        0.0
    } else {
        let span = cmax - cmin;
        let redc = (cmax - r) / span;
        let greenc = (cmax - g) / span;
        let bluec = (cmax - b) / span;
        let sector = if r == cmax {
            bluec - greenc
        } else if g == cmax {
            2.0 + redc - bluec
        } else {
            4.0 + greenc - redc
        };
        let h = sector / 6.0;
        if h < 0.0 { h + 1.0 } else { h }
    };

    Hsb::new(hue * 360.0, saturation * 100.0, brightness * 100.0)
}

/// HSB view of the colour part of a packed value.
pub fn packed_to_hsb(rgb_packed: u32) -> Hsb {
    let color = decode_color(rgb_packed);
    rgb_to_hsb(color.red, color.green, color.blue)
}
