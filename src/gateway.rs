//! Socket-free protocol core.
//!
//! [`Gateway`] consumes raw datagrams and returns the datagrams to send in
//! reply. It owns the session and the device registry; the engine only moves
//! bytes between it and the socket.

use crate::binding::{BoundEvent, EventKind, ItemBinding};
use crate::codec::{apply_brightness_delta, brightness_of, encode_color, encode_color_from_on_off};
use crate::config::EngineConfig;
use crate::crypto::{AesKeyEncryptor, KeyEncryptor};
use crate::error::{GatewayError, Result};
use crate::item::{Command, ItemRegistry};
use crate::mapper::EventMapper;
use crate::payload::parse_payload;
use crate::protocol::{
    CommandEncoder, CommandType, FieldValue, GatewayMessage, classify, model, pack_get_id_list,
    pack_read, pack_whois, parse_id_list,
};
use crate::registry::{DeviceRecord, DeviceRegistry};
use crate::session::{GatewaySession, SharedSession};
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::broadcast;

const FIELD_RGB: &str = "rgb";
const FIELD_STATUS: &str = "status";

/// A datagram ready to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub target: SocketAddr,
    pub payload: String,
}

impl Outbound {
    pub fn new(target: SocketAddr, payload: String) -> Self {
        Self { target, payload }
    }
}

/// Notifications published while the engine runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The gateway answered `whois`.
    GatewayDiscovered { sid: String, endpoint: SocketAddr },
    /// A device was seen for the first time.
    DeviceDiscovered(DeviceRecord),
}

/// Protocol state machine shared by the receive loop, the poll loop and
/// command callers.
pub struct Gateway {
    config: RwLock<EngineConfig>,
    session: SharedSession,
    devices: DeviceRegistry,
    items: Arc<dyn ItemRegistry>,
    encryptor: Arc<dyn KeyEncryptor>,
    event_tx: broadcast::Sender<EngineEvent>,
}

impl Gateway {
    /// Creates a core that encrypts write keys with [`AesKeyEncryptor`].
    pub fn new(config: EngineConfig, items: Arc<dyn ItemRegistry>) -> Self {
        let (event_tx, _) = broadcast::channel(32);
        Self {
            config: RwLock::new(config),
            session: SharedSession::new(),
            devices: DeviceRegistry::new(),
            items,
            encryptor: Arc::new(AesKeyEncryptor::new()),
            event_tx,
        }
    }

    /// Replaces the write-key primitive.
    pub fn with_encryptor(mut self, encryptor: Arc<dyn KeyEncryptor>) -> Self {
        self.encryptor = encryptor;
        self
    }

    pub fn config(&self) -> EngineConfig {
        self.config.read().clone()
    }

    pub fn set_config(&self, config: EngineConfig) {
        *self.config.write() = config;
    }

    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    pub fn items(&self) -> &Arc<dyn ItemRegistry> {
        &self.items
    }

    /// Receiver for gateway discovery notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    /// The multicast `whois` probe.
    pub fn whois(&self) -> Outbound {
        let target = self.config.read().discovery_target();
        self.session.mark_probe_sent();
        debug!("Sending whois to {}", target);
        Outbound::new(target, pack_whois())
    }

    /// Processes one inbound datagram.
    ///
    /// Never fails: every problem is logged and the datagram dropped.
    pub fn handle_datagram(&self, raw: &[u8]) -> Vec<Outbound> {
        debug!("Received packet: {}", String::from_utf8_lossy(raw));

        let mut msg = match classify(raw) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping datagram: {}", e);
                return Vec::new();
            }
        };

        if msg.model.is_none()
            && let Some(sid) = msg.sid.as_deref()
        {
            msg.model = self.devices.model_of(sid);
        }

        if let (Some(sid), Some(model)) = (msg.sid.as_deref(), msg.model.as_deref())
            && let Err(e) = self.devices.register(sid, model)
        {
            warn!("Failed to register device {}: {}", sid, e);
        }

        match self.dispatch(&msg) {
            Ok(outbound) => outbound,
            Err(GatewayError::UnknownCommand(name)) => {
                warn!("Unknown Xiaomi gateway command: {}", name);
                Vec::new()
            }
            Err(e) => {
                warn!("Failed to handle {}: {}", msg.cmd_name, e);
                Vec::new()
            }
        }
    }

    /// Routes a classified message by command.
    pub fn dispatch(&self, msg: &GatewayMessage) -> Result<Vec<Outbound>> {
        let Some(cmd) = msg.cmd else {
            return Err(GatewayError::UnknownCommand(msg.cmd_name.clone()));
        };

        match cmd {
            CommandType::Iam => self.on_iam(msg),
            CommandType::GetIdListAck => self.on_id_list(msg),
            CommandType::ReadAck | CommandType::Report => {
                self.fan_out(msg);
                Ok(Vec::new())
            }
            CommandType::Write => {
                error!(
                    "Received write command which is designed for the gateway. Is the developer key right? sid: {:?}",
                    msg.sid
                );
                Ok(Vec::new())
            }
            CommandType::WriteAck => {
                if parse_payload(msg).has_error() {
                    error!("Received error write ack: {:?}", msg.data);
                }
                Ok(Vec::new())
            }
            CommandType::Heartbeat => {
                if msg.is_model(model::GATEWAY) {
                    if let Some(token) = msg.token.as_deref() {
                        self.session.set_token(token);
                    }
                } else if !msg.is_any_model(&[model::CUBE, model::SWITCH]) {
                    self.fan_out(msg);
                }
                Ok(Vec::new())
            }
            CommandType::Whois | CommandType::GetIdList | CommandType::Read => {
                debug!("Ignoring outbound-only command {}", cmd);
                Ok(Vec::new())
            }
        }
    }

    fn on_iam(&self, msg: &GatewayMessage) -> Result<Vec<Outbound>> {
        let sid = msg
            .sid
            .as_deref()
            .ok_or_else(|| GatewayError::MalformedMessage("iam without sid".into()))?;
        let raw_ip = msg
            .ip
            .as_deref()
            .ok_or_else(|| GatewayError::MalformedMessage("iam without ip".into()))?;
        let ip: IpAddr = raw_ip
            .trim()
            .parse()
            .map_err(|_| GatewayError::MalformedMessage(format!("invalid ip '{}'", raw_ip)))?;
        let port = msg.port_number()?;

        self.session.record_gateway(sid, ip, port);
        if let Some(token) = msg.token.as_deref() {
            self.session.set_token(token);
        }
        info!(
            "Discovered Xiaomi Gateway - sid: {} ip: {} port: {}",
            sid, ip, port
        );

        let endpoint = SocketAddr::new(ip, port);
        let _ = self.event_tx.send(EngineEvent::GatewayDiscovered {
            sid: sid.to_string(),
            endpoint,
        });

        Ok(vec![
            Outbound::new(endpoint, pack_read(sid)),
            Outbound::new(endpoint, pack_get_id_list()),
        ])
    }

    fn on_id_list(&self, msg: &GatewayMessage) -> Result<Vec<Outbound>> {
        if let Some(token) = msg.token.as_deref() {
            self.session.set_token(token);
        }
        let ids = parse_id_list(msg)?;
        if self.devices.len() <= 1 {
            info!("Discovered total of {} Xiaomi smart subdevices", ids.len());
        }

        let session = self.session.snapshot();
        let endpoint = session.endpoint().ok_or(GatewayError::NotDiscovered)?;
        let gateway_sid = session.sid.or_else(|| msg.sid.clone());

        Ok(gateway_sid
            .iter()
            .chain(ids.iter())
            .map(|sid| Outbound::new(endpoint, pack_read(sid)))
            .collect())
    }

    fn fan_out(&self, msg: &GatewayMessage) {
        let fields = parse_payload(msg);
        if msg.is_model(model::GATEWAY)
            && let Some(rgb) = fields.rgb()
        {
            self.session.set_last_rgb(rgb);
        }
        EventMapper::new(self.items.as_ref()).fan_out(msg, &fields);
    }

    /// One poll step.
    ///
    /// Nothing is sent while no item is bound. Until a gateway and its token
    /// are known the step re-sends `whois`; afterwards it reads every device.
    pub fn poll(&self) -> Vec<Outbound> {
        if self.items.bindings().is_empty() {
            debug!("No bound items, skipping poll");
            return Vec::new();
        }

        let session = self.session.snapshot();
        let endpoint = match session.endpoint() {
            Some(endpoint) if !session.needs_discovery() => endpoint,
            _ => return vec![self.whois()],
        };

        self.devices
            .all_known_ids()
            .iter()
            .map(|sid| Outbound::new(endpoint, pack_read(sid)))
            .collect()
    }

    /// Forgets the gateway so the next poll starts discovery again.
    pub fn rediscover(&self) {
        info!("Forcing Xiaomi gateway rediscovery");
        self.session.forget_gateway();
    }

    /// Drops every piece of runtime state.
    pub fn reset(&self) {
        self.devices.clear();
        self.session.reset();
    }

    /// Translates a host command for `item` into write commands.
    ///
    /// Returns an empty list when the command does not apply to the item.
    pub fn command_item(&self, item: &str, command: Command) -> Result<Vec<Outbound>> {
        let item_type = self
            .items
            .item_type(item)
            .ok_or_else(|| GatewayError::ItemNotFound(item.to_string()))?;
        let binding = ItemBinding::parse(&item_type)?;
        debug!("Command {:?} for {} ({})", command, item, item_type);

        let session = self.session.snapshot();
        let is_light = [EventKind::Light, EventKind::Color, EventKind::Brightness]
            .into_iter()
            .any(|kind| binding.is_event(kind));

        if is_light && session.sid.as_deref() == Some(binding.sid.as_str()) {
            return self.command_light(&session, command);
        }

        match (&binding.event, &command) {
            (BoundEvent::Event(EventKind::Plug), Command::On | Command::Off) => {
                let status = if command == Command::On { "on" } else { "off" };
                let (endpoint, token) = Self::write_target(&session)?;
                let config = self.config.read();
                let payload = CommandEncoder::new(self.encryptor.as_ref(), &config.developer_key)
                    .write(&binding.sid, &[(FIELD_STATUS, FieldValue::from(status))], token)?;
                Ok(vec![Outbound::new(endpoint, payload)])
            }
            _ => {
                if command != Command::Off {
                    warn!(
                        "Unsupported channel/event: {} or command: {:?}",
                        item_type, command
                    );
                }
                Ok(Vec::new())
            }
        }
    }

    fn command_light(&self, session: &GatewaySession, command: Command) -> Result<Vec<Outbound>> {
        let config = self.config.read();
        let rgb = match command {
            Command::On => encode_color_from_on_off(true, config.start_color),
            Command::Off => encode_color_from_on_off(false, config.start_color),
            Command::Hsb(hsb) => {
                let (red, green, blue) = hsb.to_rgb();
                encode_color(brightness_of(session.last_rgb), red, green, blue)
            }
            Command::Percent(percent) => {
                if session.last_rgb == 0 {
                    debug!("Light is off, ignoring brightness {}", percent);
                    return Ok(Vec::new());
                }
                apply_brightness_delta(session.last_rgb, percent)
            }
        };

        let (endpoint, token) = Self::write_target(session)?;
        let gateway_sid = session.sid.as_deref().ok_or(GatewayError::NotDiscovered)?;
        let payload = CommandEncoder::new(self.encryptor.as_ref(), &config.developer_key)
            .write_gateway(gateway_sid, &[(FIELD_RGB, FieldValue::from(rgb))], token)?;
        Ok(vec![Outbound::new(endpoint, payload)])
    }

    fn write_target(session: &GatewaySession) -> Result<(SocketAddr, &str)> {
        let endpoint = session.endpoint().ok_or(GatewayError::NotDiscovered)?;
        let token = session.token.as_deref().ok_or(GatewayError::NotDiscovered)?;
        Ok((endpoint, token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{MemoryItemRegistry, State};
    use crate::session::DiscoveryState;

    fn gateway() -> (Gateway, Arc<MemoryItemRegistry>) {
        let items = Arc::new(MemoryItemRegistry::new());
        let gateway = Gateway::new(EngineConfig::default(), items.clone());
        (gateway, items)
    }

    const IAM: &str = r#"{"cmd":"iam","port":"9898","sid":"abc","model":"gateway","ip":"192.168.1.50"}"#;

    #[test]
    fn whois_targets_multicast_group() {
        let (gateway, _) = gateway();
        let out = gateway.whois();
        assert_eq!(out.target, "224.0.0.50:4321".parse().unwrap());
        assert_eq!(out.payload, r#"{"cmd":"whois"}"#);
        assert_eq!(gateway.session().snapshot().state, DiscoveryState::AwaitingIam);
    }

    #[test]
    fn iam_records_gateway() {
        let (gateway, _) = gateway();
        let mut rx = gateway.subscribe();
        let out = gateway.handle_datagram(IAM.as_bytes());

        let endpoint: SocketAddr = "192.168.1.50:9898".parse().unwrap();
        assert_eq!(out, vec![
            Outbound::new(endpoint, r#"{"cmd":"read","sid":"abc"}"#.into()),
            Outbound::new(endpoint, r#"{"cmd":"get_id_list"}"#.into()),
        ]);
        let session = gateway.session().snapshot();
        assert_eq!(session.state, DiscoveryState::Discovered);
        assert_eq!(session.sid.as_deref(), Some("abc"));
        assert_eq!(
            rx.try_recv().unwrap(),
            EngineEvent::GatewayDiscovered {
                sid: "abc".into(),
                endpoint
            }
        );
    }

    #[test]
    fn iam_with_bad_port_is_dropped() {
        let (gateway, _) = gateway();
        let raw = r#"{"cmd":"iam","port":"x","sid":"abc","model":"gateway","ip":"192.168.1.50"}"#;
        assert!(gateway.handle_datagram(raw.as_bytes()).is_empty());
        assert_eq!(gateway.session().snapshot().sid, None);
    }

    #[test]
    fn id_list_reads_every_device() {
        let (gateway, _) = gateway();
        gateway.handle_datagram(IAM.as_bytes());
        let raw = r#"{"cmd":"get_id_list_ack","sid":"abc","token":"T0K3N","data":"[\"d1\",\"d2\"]"}"#;
        let out = gateway.handle_datagram(raw.as_bytes());

        let payloads: Vec<_> = out.iter().map(|o| o.payload.as_str()).collect();
        assert_eq!(payloads, vec![
            r#"{"cmd":"read","sid":"abc"}"#,
            r#"{"cmd":"read","sid":"d1"}"#,
            r#"{"cmd":"read","sid":"d2"}"#,
        ]);
        assert_eq!(gateway.session().snapshot().token.as_deref(), Some("T0K3N"));
    }

    #[test]
    fn gateway_heartbeat_refreshes_token() {
        let (gateway, _) = gateway();
        let raw = r#"{"cmd":"heartbeat","model":"gateway","sid":"abc","token":"NEW","data":"{\"ip\":\"192.168.1.50\"}"}"#;
        assert!(gateway.handle_datagram(raw.as_bytes()).is_empty());
        assert_eq!(gateway.session().snapshot().token.as_deref(), Some("NEW"));
    }

    #[test]
    fn cube_heartbeat_is_ignored() {
        let (gateway, items) = gateway();
        items.bind("Cube", "cube1.flip90");
        let raw = r#"{"cmd":"heartbeat","model":"cube","sid":"cube1","data":"{\"status\":\"flip90\"}"}"#;
        gateway.handle_datagram(raw.as_bytes());
        assert!(items.commands().is_empty());

        let raw = raw.replace("heartbeat", "report");
        gateway.handle_datagram(raw.as_bytes());
        assert_eq!(items.commands(), vec![("Cube".to_string(), Command::On)]);
    }

    #[test]
    fn gateway_reports_track_last_rgb() {
        let (gateway, items) = gateway();
        items.bind("Light", "abc.light");
        let raw = r#"{"cmd":"report","model":"gateway","sid":"abc","data":"{\"rgb\":1677786880}"}"#;
        gateway.handle_datagram(raw.as_bytes());
        assert_eq!(gateway.session().last_rgb(), 1677786880);
        assert_eq!(items.updates(), vec![("Light".to_string(), State::On)]);
    }

    #[test]
    fn known_model_fills_in_missing_one() {
        let (gateway, items) = gateway();
        items.bind("Motion", "m1.motion");
        let first = r#"{"cmd":"report","model":"motion","sid":"m1","data":"{\"status\":\"no_motion\"}"}"#;
        gateway.handle_datagram(first.as_bytes());

        let bare = r#"{"cmd":"read_ack","sid":"m1","data":"{\"status\":\"motion\"}"}"#;
        gateway.handle_datagram(bare.as_bytes());
        assert_eq!(items.updates(), vec![
            ("Motion".to_string(), State::Closed),
            ("Motion".to_string(), State::Open),
        ]);
    }

    #[test]
    fn garbage_and_unknown_commands_are_dropped() {
        let (gateway, _) = gateway();
        assert!(gateway.handle_datagram(b"not json").is_empty());
        assert!(gateway.handle_datagram(br#"{"cmd":"dance"}"#).is_empty());
        assert!(gateway.handle_datagram(br#"{"sid":"abc"}"#).is_empty());
        assert!(gateway.handle_datagram(br#"{"cmd":"write","sid":"x"}"#).is_empty());
    }

    #[test]
    fn poll_gating() {
        let (gateway, items) = gateway();
        assert!(gateway.poll().is_empty());

        items.bind("Motion", "d1.motion");
        let out = gateway.poll();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload, r#"{"cmd":"whois"}"#);

        gateway.handle_datagram(IAM.as_bytes());
        // discovered but no token yet
        assert_eq!(gateway.poll()[0].payload, r#"{"cmd":"whois"}"#);

        gateway.session().set_token("T");
        let out = gateway.poll();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload, r#"{"cmd":"read","sid":"abc"}"#);
    }

    #[test]
    fn rediscover_clears_identity() {
        let (gateway, _) = gateway();
        gateway.handle_datagram(IAM.as_bytes());
        gateway.session().set_token("T");
        gateway.rediscover();
        let session = gateway.session().snapshot();
        assert_eq!(session.sid, None);
        assert_eq!(session.token, None);
        assert_eq!(session.state, DiscoveryState::Undiscovered);
    }

    #[test]
    fn commands_need_a_known_item_and_gateway() {
        let (gateway, items) = gateway();
        assert!(matches!(
            gateway.command_item("Ghost", Command::On),
            Err(GatewayError::ItemNotFound(_))
        ));

        items.bind("Plug", "p1.plug");
        assert!(matches!(
            gateway.command_item("Plug", Command::On),
            Err(GatewayError::NotDiscovered)
        ));
    }

    #[test]
    fn unsupported_commands_are_ignored() {
        let (gateway, items) = gateway();
        items.bind("Motion", "d1.motion");
        assert!(gateway.command_item("Motion", Command::On).unwrap().is_empty());
        assert!(gateway.command_item("Motion", Command::Off).unwrap().is_empty());
    }

    #[test]
    fn reset_forgets_everything() {
        let (gateway, _) = gateway();
        gateway.handle_datagram(IAM.as_bytes());
        assert_eq!(gateway.devices().len(), 1);
        gateway.reset();
        assert!(gateway.devices().is_empty());
        assert_eq!(gateway.session().snapshot(), GatewaySession::default());
    }
}
