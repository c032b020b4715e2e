use std::{fmt, fs, path::Path};

use rustc_hash::FxHashMap;
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::AppError;
use crate::validation;

pub const DEFAULT_SERVER_PORT: u16 = 33101;
pub const DEFAULT_GPIO_CHIP: &str = "/dev/gpiochip0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PinLevel {
    Low,
    High,
}

impl PinLevel {
    pub fn inverted(self) -> Self {
        match self {
            PinLevel::Low => PinLevel::High,
            PinLevel::High => PinLevel::Low,
        }
    }
}

impl<'de> Deserialize<'de> for PinLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw.eq_ignore_ascii_case("high") {
            Ok(PinLevel::High)
        } else if raw.eq_ignore_ascii_case("low") {
            Ok(PinLevel::Low)
        } else {
            Err(de::Error::custom(format!(
                "pin level must be either \"High\" or \"Low\", got \"{raw}\""
            )))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeDetect {
    None,
    Rising,
    Falling,
}

/// One controllable relay: a `(source, output)` pair bound to a pin.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    #[serde(default)]
    pub source_name: String,
    #[serde(default)]
    pub output_name: String,
    #[serde(default)]
    pub relay_pin: i32,
    #[serde(default = "default_active_low")]
    pub active_low: bool,
    /// Sent to the TCP mirror endpoint whenever this route is activated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror_message: Option<String>,
}

fn default_active_low() -> bool {
    true
}

impl RouteConfig {
    pub fn active_level(&self) -> PinLevel {
        if self.active_low {
            PinLevel::Low
        } else {
            PinLevel::High
        }
    }

    pub fn inactive_level(&self) -> PinLevel {
        self.active_level().inverted()
    }

    pub fn matches(&self, source: &str, output: &str) -> bool {
        self.source_name.eq_ignore_ascii_case(source)
            && self.output_name.eq_ignore_ascii_case(output)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhysicalButtonConfig {
    #[serde(default)]
    pub pin_number: i32,
    #[serde(default = "default_trigger_level")]
    pub trigger_level: PinLevel,
}

fn default_trigger_level() -> PinLevel {
    PinLevel::Low
}

impl PhysicalButtonConfig {
    pub fn trigger_edge(&self) -> EdgeDetect {
        match self.trigger_level {
            PinLevel::Low => EdgeDetect::Falling,
            PinLevel::High => EdgeDetect::Rising,
        }
    }
}

/// Failsafe relay held active while routing and released on shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InactiveRelaySettings {
    #[serde(default)]
    pub pin: i32,
    #[serde(default = "default_inactive_level")]
    pub inactive_level: PinLevel,
}

fn default_inactive_level() -> PinLevel {
    PinLevel::High
}

impl InactiveRelaySettings {
    pub fn active_level(&self) -> PinLevel {
        self.inactive_level.inverted()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorTarget {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for MirrorTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSettings {
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_mirror_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_mirror_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp_api_port: Option<u16>,

    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_source: Option<String>,
    // file order
    #[serde(default, with = "ordered_pairs", skip_serializing_if = "Vec::is_empty")]
    pub default_routes: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "FxHashMap::is_empty")]
    pub physical_source_buttons: FxHashMap<String, PhysicalButtonConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inactive_relay: Option<InactiveRelaySettings>,

    #[serde(default)]
    pub use_mock_gpio: bool,
    #[serde(default = "default_gpio_chip")]
    pub gpio_chip: String,

    // Display options, carried for clients.
    #[serde(default)]
    pub flash_on_select: bool,
    #[serde(default)]
    pub show_ip_on_screen: bool,
    #[serde(default)]
    pub logging: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub logo_file: String,
    #[serde(default, skip_serializing_if = "FxHashMap::is_empty")]
    pub source_color_palette: FxHashMap<String, String>,
}

fn default_server_port() -> u16 {
    DEFAULT_SERVER_PORT
}

fn default_gpio_chip() -> String {
    DEFAULT_GPIO_CHIP.to_string()
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            server_port: DEFAULT_SERVER_PORT,
            tcp_mirror_address: None,
            tcp_mirror_port: None,
            udp_api_port: None,
            routes: Vec::new(),
            default_source: None,
            default_routes: Vec::new(),
            physical_source_buttons: FxHashMap::default(),
            inactive_relay: None,
            use_mock_gpio: false,
            gpio_chip: default_gpio_chip(),
            flash_on_select: false,
            show_ip_on_screen: false,
            logging: false,
            logo_file: String::new(),
            source_color_palette: FxHashMap::default(),
        }
    }
}

impl AppSettings {
    pub fn sources(&self) -> Vec<String> {
        distinct(self.routes.iter().map(|r| r.source_name.as_str()))
    }

    pub fn outputs(&self) -> Vec<String> {
        distinct(self.routes.iter().map(|r| r.output_name.as_str()))
    }

    pub fn find_route(&self, source: &str, output: &str) -> Option<&RouteConfig> {
        self.routes.iter().find(|r| r.matches(source, output))
    }

    pub fn first_route_for(&self, source: &str) -> Option<&RouteConfig> {
        self.routes
            .iter()
            .find(|r| r.source_name.eq_ignore_ascii_case(source))
    }

    pub fn find_source(&self, source: &str) -> Option<&str> {
        self.first_route_for(source).map(|r| r.source_name.as_str())
    }

    pub fn mirror_target(&self) -> Option<MirrorTarget> {
        match (&self.tcp_mirror_address, self.tcp_mirror_port) {
            (Some(host), Some(port)) if !host.trim().is_empty() => Some(MirrorTarget {
                host: host.trim().to_string(),
                port,
            }),
            _ => None,
        }
    }

    /// Keeps the listener ports of the running configuration, since those
    /// sockets are bound once at startup. Returns whether anything changed.
    pub fn keep_listener_ports(&mut self, running: &AppSettings) -> bool {
        let changed = self.server_port != running.server_port
            || self.udp_api_port != running.udp_api_port;
        self.server_port = running.server_port;
        self.udp_api_port = running.udp_api_port;
        changed
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, AppError> {
        let contents = fs::read_to_string(&path)?;
        Self::from_json_str(&contents)
    }

    /// Parses a configuration document. Keys match case-insensitively and
    /// comments or trailing commas are tolerated.
    pub fn from_json_str(contents: &str) -> Result<Self, AppError> {
        let cleaned = strip_json_extensions(contents);
        let value: Value = serde_json::from_str(&cleaned)
            .map_err(|e| AppError::Config(format!("Invalid config json: {e}")))?;
        if !value.is_object() {
            return Err(AppError::Config(
                "Invalid config json: top level must be an object".into(),
            ));
        }
        serde_json::from_value(canonicalize_settings(value))
            .map_err(|e| AppError::Config(format!("Invalid config json: {e}")))
    }

    pub fn to_json_string(&self) -> Result<String, AppError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| AppError::Config(format!("Failed to serialize config: {e}")))
    }

    /// Validates, then writes the settings back to disk.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), AppError> {
        validation::validate(self).map_err(AppError::Validation)?;
        let json = self.to_json_string()?;
        fs::write(&path, json)?;
        Ok(())
    }
}

fn distinct<'a>(names: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    for name in names {
        if !seen.iter().any(|s| s == name) {
            seen.push(name.to_string());
        }
    }
    seen
}

type FieldTable = &'static [(&'static str, &'static [&'static str])];

const SETTINGS_FIELDS: FieldTable = &[
    ("serverPort", &[]),
    ("tcpMirrorAddress", &[]),
    ("tcpMirrorPort", &[]),
    ("udpApiPort", &[]),
    ("routes", &[]),
    ("defaultSource", &[]),
    ("defaultRoutes", &[]),
    ("physicalSourceButtons", &[]),
    ("inactiveRelay", &[]),
    ("useMockGpio", &[]),
    ("gpioChip", &[]),
    ("flashOnSelect", &[]),
    ("showIpOnScreen", &[]),
    ("logging", &[]),
    ("logoFile", &[]),
    ("sourceColorPalette", &[]),
];

const ROUTE_FIELDS: FieldTable = &[
    ("sourceName", &[]),
    ("outputName", &[]),
    ("relayPin", &[]),
    ("activeLow", &[]),
    ("mirrorMessage", &["tcpMessage"]),
];

const BUTTON_FIELDS: FieldTable = &[
    ("pinNumber", &[]),
    ("triggerLevel", &["triggerState"]),
];

const INACTIVE_RELAY_FIELDS: FieldTable = &[("pin", &[]), ("inactiveLevel", &["inactiveState"])];

/// Rewrites struct keys to their canonical spelling. Map keys that carry
/// user data (source names) are left untouched.
fn canonicalize_settings(value: Value) -> Value {
    let Value::Object(root) = value else {
        return value;
    };
    let mut root = rename_keys(root, SETTINGS_FIELDS);

    if let Some(Value::Array(routes)) = root.get_mut("routes") {
        for route in routes.iter_mut() {
            if let Value::Object(obj) = route {
                *obj = rename_keys(std::mem::take(obj), ROUTE_FIELDS);
            }
        }
    }
    if let Some(Value::Object(buttons)) = root.get_mut("physicalSourceButtons") {
        for button in buttons.values_mut() {
            if let Value::Object(obj) = button {
                *obj = rename_keys(std::mem::take(obj), BUTTON_FIELDS);
            }
        }
    }
    if let Some(Value::Object(obj)) = root.get_mut("inactiveRelay") {
        *obj = rename_keys(std::mem::take(obj), INACTIVE_RELAY_FIELDS);
    }

    Value::Object(root)
}

fn rename_keys(obj: Map<String, Value>, fields: FieldTable) -> Map<String, Value> {
    obj.into_iter()
        .map(|(key, value)| {
            let canonical = fields.iter().find_map(|(name, aliases)| {
                (name.eq_ignore_ascii_case(&key) || aliases.iter().any(|a| a.eq_ignore_ascii_case(&key)))
                    .then_some(*name)
            });
            match canonical {
                Some(name) => (name.to_string(), value),
                None => (key, value),
            }
        })
        .collect()
}

/// Removes `//` and `/* */` comments and trailing commas outside of strings.
fn strip_json_extensions(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut without_comments = String::with_capacity(input.len());
    let mut i = 0;
    let mut in_string = false;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            without_comments.push(c);
            if c == '\\' && i + 1 < chars.len() {
                without_comments.push(chars[i + 1]);
                i += 2;
                continue;
            }
            if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match (c, chars.get(i + 1)) {
            ('"', _) => {
                in_string = true;
                without_comments.push(c);
                i += 1;
            }
            ('/', Some('/')) => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            ('/', Some('*')) => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i += 2;
            }
            _ => {
                without_comments.push(c);
                i += 1;
            }
        }
    }

    let chars: Vec<char> = without_comments.chars().collect();
    let mut out = String::with_capacity(chars.len());
    in_string = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if c == '\\' && i + 1 < chars.len() {
                out.push(chars[i + 1]);
                i += 2;
                continue;
            }
            if c == '"' {
                in_string = false;
            }
        } else if c == '"' {
            in_string = true;
            out.push(c);
        } else if c == ',' {
            let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
            if !matches!(next, Some('}') | Some(']')) {
                out.push(c);
            }
        } else {
            out.push(c);
        }
        i += 1;
    }
    out
}

mod ordered_pairs {
    use super::*;

    pub fn serialize<S: Serializer>(pairs: &[(String, String)], serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(pairs.len()))?;
        for (key, value) in pairs {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<(String, String)>, D::Error> {
        struct PairsVisitor;

        impl<'de> Visitor<'de> for PairsVisitor {
            type Value = Vec<(String, String)>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of source names to output names")
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(Vec::new())
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut pairs = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, value)) = access.next_entry::<String, Option<String>>()? {
                    pairs.push((key, value.unwrap_or_default()));
                }
                Ok(pairs)
            }
        }

        deserializer.deserialize_any(PairsVisitor)
    }
}
