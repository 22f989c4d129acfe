//! Maps device messages onto bound items.
//!
//! For every item bound to the sending device, [`evaluate`] decides whether
//! the message is the event the item listens for and what to publish. The
//! [`EventMapper`] then checks the item's current state and talks to the host.

use crate::binding::{BoundEvent, CubeGesture, EventKind, ItemBinding};
use crate::codec::{brightness_of, decode_htp_value, packed_to_hsb};
use crate::error::{GatewayError, Result};
use crate::item::{Command, ItemLookup, ItemRegistry, State};
use crate::payload::PayloadFields;
use crate::protocol::{GatewayMessage, model};
use log::{debug, warn};

const STATUS_CLICK: &str = "click";
const STATUS_DOUBLE_CLICK: &str = "double_click";
const STATUS_BOTH_CLICK: &str = "both_click";
const STATUS_LONG_PRESS: &str = "long_click_press";
const STATUS_LONG_RELEASE: &str = "long_click_release";
const STATUS_MOTION: &str = "motion";
const STATUS_NO_MOTION: &str = "no_motion";
const STATUS_CLOSE: &str = "close";
const STATUS_ON: &str = "on";
const STATUS_OFF: &str = "off";
const INUSE_YES: &str = "1";
const DUAL_CHANNEL: &str = "dual_channel";

/// What a message means for one bound item.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Publish a state. Skipped when unchanged unless `always` is set.
    Update { state: State, always: bool },
    /// Send a command to the item.
    Command(Command),
    /// Send the opposite of the item's current on/off state.
    Toggle,
}

impl Outcome {
    fn update(state: State) -> Self {
        Outcome::Update {
            state,
            always: false,
        }
    }

    /// Momentary conditions (motion, plug on, in use) are republished even
    /// when the item already holds the same value.
    fn retriggerable(state: State, retrigger: bool) -> Self {
        Outcome::Update {
            state,
            always: retrigger,
        }
    }
}

fn htp(raw: Option<String>, model_ok: bool) -> Result<Option<Outcome>> {
    match raw {
        Some(raw) if model_ok => {
            let value = decode_htp_value(&raw)?;
            Ok(Some(Outcome::update(State::Decimal(value))))
        }
        _ => Ok(None),
    }
}

fn parse_integer(raw: &str, what: &str) -> Result<f64> {
    raw.trim()
        .parse::<i64>()
        .map(|v| v as f64)
        .map_err(|_| GatewayError::Decode(format!("{} '{}' is not an integer", what, raw)))
}

fn parse_decimal(raw: &str, what: &str) -> Result<f64> {
    raw.trim()
        .parse::<f64>()
        .map_err(|_| GatewayError::Decode(format!("{} '{}' is not a number", what, raw)))
}

/// Push button (`switch`) whose status equals `click`.
fn is_button_event(msg: &GatewayMessage, fields: &PayloadFields, click: &str) -> bool {
    msg.is_model(model::SWITCH) && fields.status().as_deref() == Some(click)
}

/// Wireless wall switch whose bound channel reports `click`.
fn is_wall_button_event(
    msg: &GatewayMessage,
    fields: &PayloadFields,
    binding: &ItemBinding,
    click: &str,
) -> bool {
    msg.is_any_model(&[model::WALL_SWITCH_1, model::WALL_SWITCH_2])
        && fields.channel(&binding.channel).as_deref() == Some(click)
}

/// Gesture carried by a cube message, if any.
///
/// A `rotate` field wins over `status`.
pub fn cube_gesture(fields: &PayloadFields) -> Option<std::result::Result<CubeGesture, String>> {
    if let Some(rotate) = fields.rotate() {
        return Some(Ok(CubeGesture::from_rotation(&rotate)));
    }
    fields
        .status()
        .map(|status| CubeGesture::from_wire(&status).ok_or(status))
}

/// Decides what `msg` means for the item bound as `binding`.
///
/// `Ok(None)` means the message is not an event for this item.
pub fn evaluate(
    msg: &GatewayMessage,
    fields: &PayloadFields,
    binding: &ItemBinding,
) -> Result<Option<Outcome>> {
    let kind = match &binding.event {
        BoundEvent::Event(kind) => *kind,
        BoundEvent::Cube(gesture) => return Ok(evaluate_cube(msg, fields, *gesture)),
        BoundEvent::Unknown(name) => {
            if msg.is_model(model::CUBE) {
                return Ok(None);
            }
            return Err(GatewayError::UnknownEvent(name.clone()));
        }
    };

    let is_gateway = msg.is_model(model::GATEWAY);
    let status = fields.status().map(|s| s.to_lowercase());

    let outcome = match kind {
        EventKind::Temperature => {
            return htp(
                fields.temperature(),
                msg.is_any_model(&[model::SENSOR_HT, model::WEATHER]),
            );
        }
        EventKind::Humidity => {
            return htp(
                fields.humidity(),
                msg.is_any_model(&[model::SENSOR_HT, model::WEATHER]),
            );
        }
        EventKind::Pressure => {
            return htp(fields.pressure(), msg.is_model(model::WEATHER));
        }
        EventKind::Light => fields
            .rgb()
            .filter(|_| is_gateway)
            .map(|rgb| Outcome::update(State::on_off(rgb > 0))),
        EventKind::Color => fields
            .rgb()
            .filter(|_| is_gateway)
            .map(|rgb| Outcome::update(State::Hsb(packed_to_hsb(rgb)))),
        EventKind::Brightness => fields
            .rgb()
            .filter(|_| is_gateway)
            .map(|rgb| Outcome::update(State::Percent(brightness_of(rgb)))),
        EventKind::Illumination => fields
            .illumination()
            .filter(|_| is_gateway)
            .map(|lux| Outcome::update(State::Decimal(lux as f64))),
        EventKind::VirtualSwitch => {
            (fields.status().as_deref() == Some(STATUS_CLICK)).then_some(Outcome::Toggle)
        }
        EventKind::Click => (is_button_event(msg, fields, STATUS_CLICK)
            || is_wall_button_event(msg, fields, binding, STATUS_CLICK))
        .then_some(Outcome::Command(Command::On)),
        EventKind::DoubleClick => (is_button_event(msg, fields, STATUS_DOUBLE_CLICK)
            || is_wall_button_event(msg, fields, binding, STATUS_DOUBLE_CLICK))
        .then_some(Outcome::Command(Command::On)),
        EventKind::BothClick => (msg.is_model(model::WALL_SWITCH_2)
            && binding.channel == DUAL_CHANNEL
            && fields.channel(&binding.channel).as_deref() == Some(STATUS_BOTH_CLICK))
        .then_some(Outcome::Command(Command::On)),
        EventKind::LongClick => is_button_event(msg, fields, STATUS_LONG_PRESS)
            .then_some(Outcome::Command(Command::On)),
        EventKind::LongClickRelease => is_button_event(msg, fields, STATUS_LONG_RELEASE)
            .then_some(Outcome::Command(Command::On)),
        EventKind::Switch => {
            if msg.is_any_model(&[model::CTRL_LN1, model::CTRL_LN2]) {
                fields.channel(&binding.channel).map(|value| {
                    Outcome::update(State::on_off(value.to_lowercase() == STATUS_ON))
                })
            } else {
                None
            }
        }
        EventKind::Magnet => {
            if msg.is_any_model(&[model::MAGNET, model::MAGNET_AQ2]) {
                status.map(|s| Outcome::update(State::open_closed(s != STATUS_CLOSE)))
            } else {
                None
            }
        }
        EventKind::Motion => msg.is_model(model::MOTION).then(|| {
            let open = status.as_deref().unwrap_or(STATUS_NO_MOTION) == STATUS_MOTION;
            Outcome::retriggerable(State::open_closed(open), open)
        }),
        EventKind::Plug => msg
            .is_any_model(&[model::PLUG, model::WALL_PLUG])
            .then(|| {
                let on = status.as_deref().unwrap_or(STATUS_OFF) == STATUS_ON;
                Outcome::retriggerable(State::on_off(on), on)
            }),
        EventKind::Inuse => {
            if !msg.is_model(model::PLUG) {
                None
            } else if let Some(inuse) = fields.inuse() {
                let on = inuse == INUSE_YES;
                Some(Outcome::retriggerable(State::on_off(on), on))
            } else if status.as_deref() == Some(STATUS_OFF) {
                Some(Outcome::update(State::Off))
            } else {
                None
            }
        }
        EventKind::PowerConsumed | EventKind::LoadPower => {
            if !msg.is_any_model(&[model::PLUG, model::WALL_PLUG]) {
                None
            } else if let Some(raw) = fields.power(kind.as_str()) {
                Some(Outcome::update(State::Decimal(parse_decimal(
                    &raw,
                    kind.as_str(),
                )?)))
            } else if status.as_deref() == Some(STATUS_OFF) && kind == EventKind::LoadPower {
                Some(Outcome::update(State::Decimal(0.0)))
            } else {
                None
            }
        }
        EventKind::Voltage => fields
            .voltage()
            .map(|v| Outcome::update(State::Decimal(v as f64))),
        EventKind::Alarm => match status {
            Some(s) if msg.is_any_model(&[model::SMOKE, model::NATGAS]) => {
                Some(Outcome::update(State::Decimal(parse_integer(&s, "alarm")?)))
            }
            _ => None,
        },
        EventKind::Density => match fields.density() {
            Some(d) if msg.is_model(model::SMOKE) => {
                Some(Outcome::update(State::Decimal(parse_integer(&d, "density")?)))
            }
            _ => None,
        },
    };

    Ok(outcome)
}

fn evaluate_cube(
    msg: &GatewayMessage,
    fields: &PayloadFields,
    bound: CubeGesture,
) -> Option<Outcome> {
    if !msg.is_model(model::CUBE) {
        return None;
    }
    match cube_gesture(fields)? {
        Ok(gesture) => {
            debug!("Processing cube event {}", gesture);
            (gesture == bound).then_some(Outcome::Command(Command::On))
        }
        Err(unknown) => {
            warn!("Unknown cube event: {}", unknown);
            None
        }
    }
}

/// Delivers message outcomes to the host's items.
pub struct EventMapper<'a> {
    items: &'a dyn ItemRegistry,
}

impl<'a> EventMapper<'a> {
    pub fn new(items: &'a dyn ItemRegistry) -> Self {
        Self { items }
    }

    /// Runs `msg` against every item bound to its sid.
    ///
    /// Failures are logged per item and never stop the other items.
    /// Returns the number of updates and commands delivered.
    pub fn fan_out(&self, msg: &GatewayMessage, fields: &PayloadFields) -> usize {
        let Some(sid) = msg.sid.as_deref() else {
            return 0;
        };

        let mut delivered = 0;
        for (item, item_type) in self.items.bindings() {
            let binding = match ItemBinding::parse(&item_type) {
                Ok(b) if b.sid == sid => b,
                Ok(_) => continue,
                Err(e) => {
                    debug!("Skipping item {}: {}", item, e);
                    continue;
                }
            };

            let result = evaluate(msg, fields, &binding).and_then(|outcome| match outcome {
                Some(outcome) => {
                    debug!("Processing {} event for {}", binding.event_name(), item);
                    self.apply(&item, outcome)
                }
                None => Ok(false),
            });

            match result {
                Ok(true) => delivered += 1,
                Ok(false) => {}
                Err(GatewayError::UnknownEvent(event)) => {
                    debug!("Item {} is bound to unknown event {}", item, event)
                }
                Err(e) => warn!("Failed to process {} for item {}: {}", binding.event_name(), item, e),
            }
        }
        delivered
    }

    /// Delivers one outcome. Returns whether anything was sent to the host.
    pub fn apply(&self, item: &str, outcome: Outcome) -> Result<bool> {
        match outcome {
            Outcome::Update { state, always } => {
                let current = self.current_state(item)?;
                if always || current != state {
                    debug!("Updating {} to {:?}", item, state);
                    self.items.post_update(item, state);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Outcome::Command(command) => {
                debug!("Sending {:?} to {}", command, item);
                self.items.send_command(item, command);
                Ok(true)
            }
            Outcome::Toggle => {
                let current = self.current_state(item)?;
                let command = Command::on_off(current != State::On);
                debug!("Toggling {} with {:?}", item, command);
                self.items.send_command(item, command);
                Ok(true)
            }
        }
    }

    fn current_state(&self, item: &str) -> Result<State> {
        match self.items.state(item) {
            ItemLookup::Found(state) => Ok(state),
            ItemLookup::NotFound => Err(GatewayError::ItemNotFound(item.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::MemoryItemRegistry;
    use crate::payload::parse_payload;
    use crate::protocol::CommandType;

    fn message(model: &str, data: &str) -> GatewayMessage {
        GatewayMessage {
            cmd: Some(CommandType::Report),
            cmd_name: "report".into(),
            sid: Some("dev".into()),
            model: Some(model.into()),
            data: Some(data.into()),
            ..Default::default()
        }
    }

    fn eval(model: &str, data: &str, item_type: &str) -> Option<Outcome> {
        let msg = message(model, data);
        let binding = ItemBinding::parse(item_type).unwrap();
        evaluate(&msg, &parse_payload(&msg), &binding).unwrap()
    }

    #[test]
    fn temperature_needs_matching_model() {
        assert_eq!(
            eval("sensor_ht", r#"{"temperature":"2362"}"#, "dev.temperature"),
            Some(Outcome::update(State::Decimal(23.62)))
        );
        assert_eq!(
            eval("weather.v1", r#"{"pressure":"100352"}"#, "dev.pressure"),
            Some(Outcome::update(State::Decimal(1003.52)))
        );
        assert_eq!(eval("motion", r#"{"temperature":"2362"}"#, "dev.temperature"), None);
        assert_eq!(eval("sensor_ht", r#"{"pressure":"100352"}"#, "dev.pressure"), None);
    }

    #[test]
    fn gateway_light() {
        let data = r#"{"rgb":1677786880,"illumination":503}"#;
        assert_eq!(
            eval("gateway", data, "dev.light"),
            Some(Outcome::update(State::On))
        );
        assert_eq!(
            eval("gateway", data, "dev.brightness"),
            Some(Outcome::update(State::Percent(100)))
        );
        assert_eq!(
            eval("gateway", data, "dev.illumination"),
            Some(Outcome::update(State::Decimal(503.0)))
        );
        assert_eq!(
            eval("gateway", r#"{"rgb":0}"#, "dev.light"),
            Some(Outcome::update(State::Off))
        );
        match eval("gateway", data, "dev.color") {
            Some(Outcome::Update {
                state: State::Hsb(hsb),
                ..
            }) => assert!((hsb.hue - 120.0).abs() < 1e-6),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(eval("plug", data, "dev.light"), None);
    }

    #[test]
    fn buttons() {
        let on = Some(Outcome::Command(Command::On));
        assert_eq!(eval("switch", r#"{"status":"click"}"#, "dev.click"), on);
        assert_eq!(eval("switch", r#"{"status":"double_click"}"#, "dev.double_click"), on);
        assert_eq!(eval("switch", r#"{"status":"click"}"#, "dev.double_click"), None);
        assert_eq!(eval("switch", r#"{"status":"long_click_press"}"#, "dev.long_click"), on);
        assert_eq!(
            eval("switch", r#"{"status":"long_click_release"}"#, "dev.long_click_release"),
            on
        );
        assert_eq!(eval("86sw1", r#"{"channel_0":"click"}"#, "dev.channel_0.click"), on);
        assert_eq!(eval("86sw2", r#"{"channel_1":"click"}"#, "dev.channel_0.click"), None);
        assert_eq!(
            eval("86sw2", r#"{"dual_channel":"both_click"}"#, "dev.dual_channel.both_click"),
            on
        );
        assert_eq!(
            eval("86sw1", r#"{"dual_channel":"both_click"}"#, "dev.dual_channel.both_click"),
            None
        );
        assert_eq!(
            eval("switch", r#"{"status":"click"}"#, "dev.virtual_switch"),
            Some(Outcome::Toggle)
        );
    }

    #[test]
    fn wall_switch_channels() {
        assert_eq!(
            eval("ctrl_ln2", r#"{"channel_1":"ON"}"#, "dev.channel_1.switch"),
            Some(Outcome::update(State::On))
        );
        assert_eq!(
            eval("ctrl_ln1", r#"{"channel_0":"off"}"#, "dev.channel_0.switch"),
            Some(Outcome::update(State::Off))
        );
        assert_eq!(eval("ctrl_ln1", r#"{"channel_1":"on"}"#, "dev.channel_0.switch"), None);
    }

    #[test]
    fn contacts_and_motion() {
        assert_eq!(
            eval("magnet", r#"{"status":"close"}"#, "dev.magnet"),
            Some(Outcome::update(State::Closed))
        );
        assert_eq!(
            eval("sensor_magnet.aq2", r#"{"status":"open"}"#, "dev.magnet"),
            Some(Outcome::update(State::Open))
        );
        assert_eq!(eval("magnet", r#"{"voltage":3005}"#, "dev.magnet"), None);
        assert_eq!(
            eval("motion", r#"{"status":"motion"}"#, "dev.motion"),
            Some(Outcome::retriggerable(State::Open, true))
        );
        assert_eq!(
            eval("motion", r#"{"no_motion":"120"}"#, "dev.motion"),
            Some(Outcome::retriggerable(State::Closed, false))
        );
    }

    #[test]
    fn plugs() {
        assert_eq!(
            eval("plug", r#"{"status":"on"}"#, "dev.plug"),
            Some(Outcome::retriggerable(State::On, true))
        );
        assert_eq!(
            eval("86plug", r#"{"status":"off"}"#, "dev.plug"),
            Some(Outcome::retriggerable(State::Off, false))
        );
        assert_eq!(
            eval("plug", r#"{"inuse":"1"}"#, "dev.inuse"),
            Some(Outcome::retriggerable(State::On, true))
        );
        assert_eq!(
            eval("plug", r#"{"status":"off"}"#, "dev.inuse"),
            Some(Outcome::update(State::Off))
        );
        assert_eq!(eval("plug", r#"{"status":"on"}"#, "dev.inuse"), None);
        assert_eq!(eval("86plug", r#"{"inuse":"1"}"#, "dev.inuse"), None);
        assert_eq!(
            eval("plug", r#"{"load_power":"12.50"}"#, "dev.load_power"),
            Some(Outcome::update(State::Decimal(12.5)))
        );
        assert_eq!(
            eval("plug", r#"{"status":"off"}"#, "dev.load_power"),
            Some(Outcome::update(State::Decimal(0.0)))
        );
        assert_eq!(eval("plug", r#"{"status":"off"}"#, "dev.power_consumed"), None);
    }

    #[test]
    fn voltage_alarm_density() {
        assert_eq!(
            eval("magnet", r#"{"voltage":3005}"#, "dev.voltage"),
            Some(Outcome::update(State::Decimal(3005.0)))
        );
        assert_eq!(
            eval("natgas", r#"{"status":"1"}"#, "dev.alarm"),
            Some(Outcome::update(State::Decimal(1.0)))
        );
        assert_eq!(
            eval("smoke", r#"{"density":"12"}"#, "dev.density"),
            Some(Outcome::update(State::Decimal(12.0)))
        );
        assert_eq!(eval("natgas", r#"{"density":"12"}"#, "dev.density"), None);

        let msg = message("smoke", r#"{"status":"loud"}"#);
        let binding = ItemBinding::parse("dev.alarm").unwrap();
        assert!(matches!(
            evaluate(&msg, &parse_payload(&msg), &binding),
            Err(GatewayError::Decode(_))
        ));
    }

    #[test]
    fn cube_gestures() {
        let on = Some(Outcome::Command(Command::On));
        assert_eq!(eval("cube", r#"{"rotate":"-30"}"#, "dev.rotate_left"), on);
        assert_eq!(eval("cube", r#"{"rotate":"15"}"#, "dev.rotate_right"), on);
        assert_eq!(eval("cube", r#"{"rotate":"15"}"#, "dev.rotate_left"), None);
        assert_eq!(eval("cube", r#"{"status":"flip90"}"#, "dev.flip90"), on);
        assert_eq!(eval("cube", r#"{"status":"flip90"}"#, "dev.flip180"), None);
        assert_eq!(eval("cube", r#"{"status":"dance"}"#, "dev.flip180"), None);
        assert_eq!(eval("cube", r#"{"voltage":3005}"#, "dev.shake_air"), None);
        assert_eq!(eval("switch", r#"{"status":"flip90"}"#, "dev.flip90"), None);
        assert_eq!(eval("cube", r#"{"status":"flip90"}"#, "dev.whatever"), None);
    }

    #[test]
    fn unknown_event_off_cube_is_error() {
        let msg = message("plug", r#"{"status":"on"}"#);
        let binding = ItemBinding::parse("dev.whatever").unwrap();
        assert!(matches!(
            evaluate(&msg, &parse_payload(&msg), &binding),
            Err(GatewayError::UnknownEvent(_))
        ));
    }

    #[test]
    fn repeat_safe_updates_are_republished() {
        let items = MemoryItemRegistry::new();
        items.bind("Motion", "dev.motion");
        items.set_state("Motion", State::Open);
        let mapper = EventMapper::new(&items);

        let msg = message("motion", r#"{"status":"motion"}"#);
        assert_eq!(mapper.fan_out(&msg, &parse_payload(&msg)), 1);

        items.set_state("Motion", State::Closed);
        let msg = message("motion", r#"{"no_motion":"60"}"#);
        assert_eq!(mapper.fan_out(&msg, &parse_payload(&msg)), 0);
        assert_eq!(items.updates(), vec![("Motion".to_string(), State::Open)]);
    }

    #[test]
    fn toggle_inverts_current_state() {
        let items = MemoryItemRegistry::new();
        items.bind("Virtual", "dev.virtual_switch");
        items.set_state("Virtual", State::On);
        let mapper = EventMapper::new(&items);

        let msg = message("switch", r#"{"status":"click"}"#);
        mapper.fan_out(&msg, &parse_payload(&msg));
        items.set_state("Virtual", State::Off);
        mapper.fan_out(&msg, &parse_payload(&msg));

        assert_eq!(items.commands(), vec![
            ("Virtual".to_string(), Command::Off),
            ("Virtual".to_string(), Command::On),
        ]);
    }

    #[test]
    fn missing_item_is_reported() {
        let items = MemoryItemRegistry::new();
        let mapper = EventMapper::new(&items);
        assert!(matches!(
            mapper.apply("Ghost", Outcome::update(State::On)),
            Err(GatewayError::ItemNotFound(_))
        ));
    }

    #[test]
    fn other_sids_are_ignored() {
        let items = MemoryItemRegistry::new();
        items.bind("Other", "other.motion");
        items.bind("Prefix", "de.motion");
        let mapper = EventMapper::new(&items);
        let msg = message("motion", r#"{"status":"motion"}"#);
        assert_eq!(mapper.fan_out(&msg, &parse_payload(&msg)), 0);
        assert!(items.updates().is_empty());
    }
}
