//! Gateway wire protocol.
//! Classifies inbound JSON datagrams and builds outbound command strings.

use crate::crypto::KeyEncryptor;
use crate::error::{GatewayError, Result};
use serde::Deserialize;
use serde_json::{Map, Value};

/// Multicast group the gateway listens on for discovery.
pub const MULTICAST_ADDR: &str = "224.0.0.50";
/// Port of the `whois` probe.
pub const DISCOVERY_PORT: u16 = 4321;
/// Unicast command port assumed until the gateway announces its own.
pub const DEFAULT_GATEWAY_PORT: u16 = 9898;
/// Size of the receive buffer; longer datagrams are truncated by the socket.
pub const BUFFER_LENGTH: usize = 1024;

/// Model strings reported by the gateway and its subdevices.
pub mod model {
    pub const GATEWAY: &str = "gateway";
    pub const SENSOR_HT: &str = "sensor_ht";
    pub const WEATHER: &str = "weather.v1";
    pub const SWITCH: &str = "switch";
    pub const WALL_SWITCH_1: &str = "86sw1";
    pub const WALL_SWITCH_2: &str = "86sw2";
    pub const CTRL_LN1: &str = "ctrl_ln1";
    pub const CTRL_LN2: &str = "ctrl_ln2";
    pub const MAGNET: &str = "magnet";
    pub const MAGNET_AQ2: &str = "sensor_magnet.aq2";
    pub const MOTION: &str = "motion";
    pub const PLUG: &str = "plug";
    pub const WALL_PLUG: &str = "86plug";
    pub const SMOKE: &str = "smoke";
    pub const NATGAS: &str = "natgas";
    pub const CUBE: &str = "cube";
}

const KEY_CMD: &str = "cmd";
const KEY_SID: &str = "sid";
const KEY_MODEL: &str = "model";
const KEY_SHORT_ID: &str = "short_id";
const KEY_DATA: &str = "data";
const KEY_KEY: &str = "key";

define_wire_enum! {
    /// Every `cmd` value exchanged with the gateway.
    pub enum CommandType : UnknownCommand {
        Whois = "whois",
        Iam = "iam",
        GetIdList = "get_id_list",
        GetIdListAck = "get_id_list_ack",
        Read = "read",
        ReadAck = "read_ack",
        Write = "write",
        WriteAck = "write_ack",
        Heartbeat = "heartbeat",
        Report = "report",
    }
}

/// A classified inbound datagram.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatewayMessage {
    /// Parsed command, `None` when the gateway sent a name we do not know
    pub cmd: Option<CommandType>,
    /// The `cmd` field as received
    pub cmd_name: String,
    pub sid: Option<String>,
    pub model: Option<String>,
    pub token: Option<String>,
    pub ip: Option<String>,
    pub port: Option<String>,
    /// Inner JSON document, still encoded as a string
    pub data: Option<String>,
}

impl GatewayMessage {
    /// Whether the message came from a device of the given model.
    pub fn is_model(&self, model: &str) -> bool {
        self.model.as_deref() == Some(model)
    }

    /// Whether the model is any of `models`.
    pub fn is_any_model(&self, models: &[&str]) -> bool {
        models.iter().any(|m| self.is_model(m))
    }

    /// Parses the announced unicast port (`iam` only).
    pub fn port_number(&self) -> Result<u16> {
        let raw = self
            .port
            .as_deref()
            .ok_or_else(|| GatewayError::MalformedMessage("iam without port".into()))?;
        raw.trim()
            .parse::<u16>()
            .map_err(|_| GatewayError::MalformedMessage(format!("invalid port '{}'", raw)))
    }
}

/// Outer datagram shape. Fields are loosely typed on the wire, so numbers and
/// strings are both accepted and normalised to strings.
#[derive(Deserialize)]
struct RawMessage {
    cmd: Option<Value>,
    #[serde(default)]
    sid: Option<Value>,
    #[serde(default)]
    model: Option<Value>,
    #[serde(default)]
    token: Option<Value>,
    #[serde(default)]
    ip: Option<Value>,
    #[serde(default)]
    port: Option<Value>,
    #[serde(default)]
    data: Option<Value>,
}

/// Renders a scalar JSON value as text; objects and arrays keep their JSON form.
pub(crate) fn loose_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

/// Parses a raw datagram into a [`GatewayMessage`].
///
/// Fails when the bytes are not a JSON object or carry no `cmd`. A malformed
/// `data` payload does not fail classification; it is dealt with when the
/// payload is read.
pub fn classify(raw: &[u8]) -> Result<GatewayMessage> {
    let value: Value = serde_json::from_slice(raw).map_err(|e| {
        if raw.len() >= BUFFER_LENGTH {
            GatewayError::MalformedMessage(format!("datagram truncated at {} bytes", raw.len()))
        } else {
            GatewayError::MalformedMessage(e.to_string())
        }
    })?;
    if !value.is_object() {
        return Err(GatewayError::MalformedMessage(
            "datagram is not a JSON object".into(),
        ));
    }
    let parsed: RawMessage = serde_json::from_value(value)
        .map_err(|e| GatewayError::MalformedMessage(e.to_string()))?;

    let cmd_name = parsed
        .cmd
        .as_ref()
        .and_then(loose_string)
        .ok_or_else(|| GatewayError::MalformedMessage("missing 'cmd' field".into()))?;

    let text = |v: Option<Value>| v.as_ref().and_then(loose_string);

    Ok(GatewayMessage {
        cmd: CommandType::from_wire(&cmd_name),
        cmd_name,
        sid: text(parsed.sid),
        model: text(parsed.model),
        token: text(parsed.token),
        ip: text(parsed.ip),
        port: text(parsed.port),
        data: text(parsed.data),
    })
}

/// Sid strings listed in a `get_id_list_ack` payload.
pub fn parse_id_list(msg: &GatewayMessage) -> Result<Vec<String>> {
    let data = msg
        .data
        .as_deref()
        .ok_or_else(|| GatewayError::MalformedMessage("id list without data".into()))?;
    let ids: Vec<Value> = serde_json::from_str(data)
        .map_err(|e| GatewayError::MalformedMessage(format!("id list: {}", e)))?;
    Ok(ids.iter().filter_map(loose_string).collect())
}

/// A single field value of a `write` command.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<u32> for FieldValue {
    fn from(n: u32) -> Self {
        FieldValue::Integer(n as i64)
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        FieldValue::Integer(n)
    }
}

impl From<&FieldValue> for Value {
    fn from(v: &FieldValue) -> Self {
        match v {
            FieldValue::Text(s) => Value::String(s.clone()),
            FieldValue::Integer(n) => Value::from(*n),
        }
    }
}

/// The `whois` discovery probe.
pub fn pack_whois() -> String {
    simple_command(CommandType::Whois)
}

/// Request for the list of subdevice sids.
pub fn pack_get_id_list() -> String {
    simple_command(CommandType::GetIdList)
}

/// Request for the current state of one device.
pub fn pack_read(sid: &str) -> String {
    let mut obj = Map::new();
    obj.insert(KEY_CMD.into(), CommandType::Read.as_str().into());
    obj.insert(KEY_SID.into(), sid.into());
    Value::Object(obj).to_string()
}

fn simple_command(cmd: CommandType) -> String {
    let mut obj = Map::new();
    obj.insert(KEY_CMD.into(), cmd.as_str().into());
    Value::Object(obj).to_string()
}

/// Builds authorised `write` commands.
///
/// The inner `data` document keeps fields in call order and always ends with
/// the derived `key`.
pub struct CommandEncoder<'a> {
    encryptor: &'a dyn KeyEncryptor,
    developer_key: &'a str,
}

impl<'a> CommandEncoder<'a> {
    pub fn new(encryptor: &'a dyn KeyEncryptor, developer_key: &'a str) -> Self {
        Self {
            encryptor,
            developer_key,
        }
    }

    /// `write` addressed to a subdevice.
    pub fn write(&self, sid: &str, fields: &[(&str, FieldValue)], token: &str) -> Result<String> {
        let data = self.write_data(fields, token)?;
        let mut obj = Map::new();
        obj.insert(KEY_CMD.into(), CommandType::Write.as_str().into());
        obj.insert(KEY_SID.into(), sid.into());
        obj.insert(KEY_DATA.into(), data.into());
        Ok(Value::Object(obj).to_string())
    }

    /// `write` addressed to the gateway itself.
    pub fn write_gateway(
        &self,
        gateway_sid: &str,
        fields: &[(&str, FieldValue)],
        token: &str,
    ) -> Result<String> {
        let data = self.write_data(fields, token)?;
        let mut obj = Map::new();
        obj.insert(KEY_CMD.into(), CommandType::Write.as_str().into());
        obj.insert(KEY_MODEL.into(), model::GATEWAY.into());
        obj.insert(KEY_SID.into(), gateway_sid.into());
        obj.insert(KEY_SHORT_ID.into(), "0".into());
        obj.insert(KEY_DATA.into(), data.into());
        Ok(Value::Object(obj).to_string())
    }

    fn write_data(&self, fields: &[(&str, FieldValue)], token: &str) -> Result<String> {
        let key = self.encryptor.encrypt(token, self.developer_key)?;
        let mut inner = Map::new();
        for (name, value) in fields.iter().filter(|(name, _)| *name != KEY_KEY) {
            inner.insert((*name).to_string(), value.into());
        }
        inner.insert(KEY_KEY.into(), key.into());
        Ok(Value::Object(inner).to_string())
    }
}
