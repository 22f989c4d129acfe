//! Item type strings of the form `sid.[channel.]event`.

use crate::error::{GatewayError, Result};

define_wire_enum! {
    /// Events an item can be bound to, apart from cube gestures.
    pub enum EventKind : UnknownEvent {
        Temperature = "temperature",
        Humidity = "humidity",
        Pressure = "pressure",
        Light = "light",
        Color = "color",
        Brightness = "brightness",
        Illumination = "illumination",
        VirtualSwitch = "virtual_switch",
        Click = "click",
        DoubleClick = "double_click",
        BothClick = "both_click",
        LongClick = "long_click",
        LongClickRelease = "long_click_release",
        Switch = "switch",
        Magnet = "magnet",
        Motion = "motion",
        Plug = "plug",
        Inuse = "inuse",
        PowerConsumed = "power_consumed",
        LoadPower = "load_power",
        Voltage = "voltage",
        Alarm = "alarm",
        Density = "density",
    }
}

define_wire_enum! {
    /// Gestures reported by the cube controller.
    pub enum CubeGesture : UnknownEvent {
        Flip90 = "flip90",
        Flip180 = "flip180",
        Move = "move",
        TapTwice = "tap_twice",
        ShakeAir = "shake_air",
        Swing = "swing",
        Alert = "alert",
        FreeFall = "free_fall",
        RotateLeft = "rotate_left",
        RotateRight = "rotate_right",
    }
}

impl CubeGesture {
    /// Direction of a cube rotation from its signed angle string.
    pub fn from_rotation(rotate: &str) -> Self {
        if rotate.trim_start().starts_with('-') {
            CubeGesture::RotateLeft
        } else {
            CubeGesture::RotateRight
        }
    }
}

/// The trailing segment of an item type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundEvent {
    Event(EventKind),
    Cube(CubeGesture),
    Unknown(String),
}

impl BoundEvent {
    pub fn parse(name: &str) -> Self {
        if let Some(kind) = EventKind::from_wire(name) {
            BoundEvent::Event(kind)
        } else if let Some(gesture) = CubeGesture::from_wire(name) {
            BoundEvent::Cube(gesture)
        } else {
            BoundEvent::Unknown(name.to_string())
        }
    }

    pub fn name(&self) -> &str {
        match self {
            BoundEvent::Event(kind) => kind.as_str(),
            BoundEvent::Cube(gesture) => gesture.as_str(),
            BoundEvent::Unknown(name) => name,
        }
    }
}

/// Parsed item type: which device, which channel, which event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemBinding {
    pub sid: String,
    /// Middle segment; empty for two-segment types
    pub channel: String,
    pub event: BoundEvent,
}

impl ItemBinding {
    /// Parses `sid.event` or `sid.channel.event`.
    ///
    /// With more than three segments the second one is the channel and the
    /// last one the event.
    pub fn parse(item_type: &str) -> Result<Self> {
        let parts: Vec<&str> = item_type.split('.').collect();
        if parts.len() < 2 || parts.iter().any(|p| p.is_empty()) {
            return Err(GatewayError::InvalidBinding(item_type.to_string()));
        }

        let channel = if parts.len() > 2 { parts[1] } else { "" };
        let event = parts[parts.len() - 1];

        Ok(Self {
            sid: parts[0].to_string(),
            channel: channel.to_string(),
            event: BoundEvent::parse(event),
        })
    }

    pub fn event_name(&self) -> &str {
        self.event.name()
    }

    pub fn is_event(&self, kind: EventKind) -> bool {
        self.event == BoundEvent::Event(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_segments() {
        let binding = ItemBinding::parse("158d0001a2b3c4.channel_0.click").unwrap();
        assert_eq!(binding.sid, "158d0001a2b3c4");
        assert_eq!(binding.channel, "channel_0");
        assert_eq!(binding.event, BoundEvent::Event(EventKind::Click));
    }

    #[test]
    fn two_segments_have_no_channel() {
        let binding = ItemBinding::parse("158d0001a2b3c4.light").unwrap();
        assert_eq!(binding.sid, "158d0001a2b3c4");
        assert_eq!(binding.channel, "");
        assert!(binding.is_event(EventKind::Light));
    }

    #[test]
    fn longer_types_use_middle_channel() {
        let binding = ItemBinding::parse("lumi.ctrl_ln1.x.switch").unwrap();
        assert_eq!(binding.sid, "lumi");
        assert_eq!(binding.channel, "ctrl_ln1");
        assert_eq!(binding.event_name(), "switch");
    }

    #[test]
    fn cube_and_unknown_events() {
        assert_eq!(
            ItemBinding::parse("cube1.rotate_left").unwrap().event,
            BoundEvent::Cube(CubeGesture::RotateLeft)
        );
        assert_eq!(
            ItemBinding::parse("x.dance").unwrap().event,
            BoundEvent::Unknown("dance".into())
        );
    }

    #[test]
    fn rejects_bad_types() {
        assert!(ItemBinding::parse("nodots").is_err());
        assert!(ItemBinding::parse("x.").is_err());
        assert!(ItemBinding::parse("").is_err());
    }

    #[test]
    fn rotation_direction() {
        assert_eq!(CubeGesture::from_rotation("-30"), CubeGesture::RotateLeft);
        assert_eq!(CubeGesture::from_rotation("15"), CubeGesture::RotateRight);
    }

    #[test]
    fn wire_names_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), *kind);
        }
    }
}
