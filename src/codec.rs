//! Reader/writer for the `OptionSettings=(key=value,...)` line used by
//! Unreal-based dedicated servers.
//!
//! A settings type describes itself through [`SettingsSchema`]: a header line,
//! a list of static pass-through pairs, and a table of typed fields. Parsing
//! only ever assigns known fields; serialization always emits the static pairs
//! first, then every field in table order.

use serde::Serialize;

pub const OPTION_SETTINGS_MARKER: &str = "OptionSettings=(";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingKind {
    Bool,
    Int,
    Float,
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl SettingValue {
    pub fn kind(&self) -> SettingKind {
        match self {
            SettingValue::Bool(_) => SettingKind::Bool,
            SettingValue::Int(_) => SettingKind::Int,
            SettingValue::Float(_) => SettingKind::Float,
            SettingValue::Text(_) => SettingKind::Text,
        }
    }

    /// Convert a raw (already unquoted) value into `kind`. `None` when the
    /// text does not parse.
    pub fn parse(kind: SettingKind, raw: &str) -> Option<SettingValue> {
        match kind {
            SettingKind::Bool => {
                if raw.eq_ignore_ascii_case("true") {
                    Some(SettingValue::Bool(true))
                } else if raw.eq_ignore_ascii_case("false") {
                    Some(SettingValue::Bool(false))
                } else {
                    None
                }
            }
            SettingKind::Int => raw.parse::<i64>().ok().map(SettingValue::Int),
            SettingKind::Float => raw
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(SettingValue::Float),
            SettingKind::Text => Some(SettingValue::Text(raw.to_string())),
        }
    }

    pub fn format(&self) -> String {
        match self {
            SettingValue::Bool(b) => b.to_string(),
            SettingValue::Int(i) => i.to_string(),
            SettingValue::Float(f) => format!("{:.6}", f),
            SettingValue::Text(s) if is_group(s) => s.clone(),
            SettingValue::Text(s) => format!("\"{}\"", escape(s)),
        }
    }
}

/// A balanced, quote-free `(...)` value is written bare, like the game does
/// for platform lists.
fn is_group(s: &str) -> bool {
    if !(s.starts_with('(') && s.ends_with(')')) || s.contains(['"', '\\']) {
        return false;
    }
    let mut depth = 0i32;
    for (i, ch) in s.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth -= 1,
            _ => {}
        }
        if depth == 0 && i + ch.len_utf8() < s.len() {
            return false;
        }
    }
    depth == 0
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Reverse of [`escape`]: a backslash takes the next character literally.
fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => out.push(chars.next().unwrap_or('\\')),
            _ => out.push(ch),
        }
    }
    out
}

impl From<bool> for SettingValue {
    fn from(v: bool) -> Self {
        SettingValue::Bool(v)
    }
}

impl From<i32> for SettingValue {
    fn from(v: i32) -> Self {
        SettingValue::Int(v.into())
    }
}

impl From<f64> for SettingValue {
    fn from(v: f64) -> Self {
        SettingValue::Float(v)
    }
}

impl From<String> for SettingValue {
    fn from(v: String) -> Self {
        SettingValue::Text(v)
    }
}

impl TryFrom<SettingValue> for bool {
    type Error = SettingValue;
    fn try_from(v: SettingValue) -> Result<Self, Self::Error> {
        match v {
            SettingValue::Bool(b) => Ok(b),
            other => Err(other),
        }
    }
}

impl TryFrom<SettingValue> for i32 {
    type Error = SettingValue;
    fn try_from(v: SettingValue) -> Result<Self, Self::Error> {
        match v {
            SettingValue::Int(i) => i32::try_from(i).map_err(|_| SettingValue::Int(i)),
            other => Err(other),
        }
    }
}

impl TryFrom<SettingValue> for f64 {
    type Error = SettingValue;
    fn try_from(v: SettingValue) -> Result<Self, Self::Error> {
        match v {
            SettingValue::Float(f) => Ok(f),
            SettingValue::Int(i) => Ok(i as f64),
            other => Err(other),
        }
    }
}

impl TryFrom<SettingValue> for String {
    type Error = SettingValue;
    fn try_from(v: SettingValue) -> Result<Self, Self::Error> {
        match v {
            SettingValue::Text(s) => Ok(s),
            other => Err(other),
        }
    }
}

/// One row of a settings table: the on-disk key, its type, and accessors.
pub struct SettingField<T> {
    pub key: &'static str,
    pub kind: SettingKind,
    pub get: fn(&T) -> SettingValue,
    /// Returns false when the value does not fit the field.
    pub set: fn(&mut T, SettingValue) -> bool,
}

pub trait SettingsSchema: Default + Sized + 'static {
    /// Section line written above the `OptionSettings` assignment.
    const HEADER: &'static str;
    /// Pairs always emitted verbatim, in this order, before mapped fields.
    const STATIC_SETTINGS: &'static [(&'static str, &'static str)];

    fn fields() -> &'static [SettingField<Self>];

    fn field(key: &str) -> Option<&'static SettingField<Self>> {
        Self::fields().iter().find(|f| f.key == key)
    }
}

/// Tracks quoting and parenthesis depth across a run of characters.
/// Inside quotes a backslash escapes exactly the next character.
struct DepthScanner {
    depth: i32,
    in_quotes: bool,
    escape_next: bool,
}

impl DepthScanner {
    fn new(depth: i32) -> Self {
        Self {
            depth,
            in_quotes: false,
            escape_next: false,
        }
    }

    /// Feed one character. Returns true when it is structural, i.e. outside a
    /// quoted span and not itself a quote.
    fn step(&mut self, ch: char) -> bool {
        if self.in_quotes {
            if self.escape_next {
                self.escape_next = false;
            } else if ch == '\\' {
                self.escape_next = true;
            } else if ch == '"' {
                self.in_quotes = false;
            }
            return false;
        }
        if ch == '"' {
            self.in_quotes = true;
            return false;
        }
        match ch {
            '(' => self.depth += 1,
            ')' => self.depth -= 1,
            _ => {}
        }
        true
    }
}

/// Locate `marker` and return everything up to its matching `)`.
///
/// `None` when the marker is missing or the group never closes.
pub fn extract_block<'a>(text: &'a str, marker: &str) -> Option<&'a str> {
    let start = text.find(marker)? + marker.len();
    let body = &text[start..];
    let mut scanner = DepthScanner::new(1);
    for (offset, ch) in body.char_indices() {
        if scanner.step(ch) && scanner.depth == 0 {
            return Some(&body[..offset]);
        }
    }
    None
}

/// Split a parameter blob on top-level commas into `(key, value)` pairs.
/// A quoted value loses its surrounding quotes and is unescaped.
pub fn split_parameters(blob: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = blob;

    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        let Some(eq) = rest.find('=') else {
            break;
        };
        let key = rest[..eq].trim().to_string();
        let after = &rest[eq + 1..];

        let mut scanner = DepthScanner::new(0);
        let mut end = after.len();
        for (offset, ch) in after.char_indices() {
            if scanner.step(ch) && ch == ',' && scanner.depth == 0 {
                end = offset;
                break;
            }
        }

        let value = after[..end].trim();
        let value = if value.len() > 1 && value.starts_with('"') && value.ends_with('"') {
            unescape(&value[1..value.len() - 1])
        } else {
            value.to_string()
        };
        params.push((key, value));

        rest = match after[end..].strip_prefix(',') {
            Some(next) => next,
            None => &after[end..],
        };
        if end == after.len() {
            break;
        }
    }

    params
}

/// Assign a raw textual value to the field named `key`.
/// Returns false for unknown keys, values of the wrong shape, and empty
/// values of non-text fields. An empty text value is a real value.
pub fn set_raw<T: SettingsSchema>(settings: &mut T, key: &str, raw: &str) -> bool {
    let Some(field) = T::field(key) else {
        return false;
    };
    if raw.is_empty() && field.kind != SettingKind::Text {
        return false;
    }
    match SettingValue::parse(field.kind, raw) {
        Some(value) => (field.set)(settings, value),
        None => false,
    }
}

pub fn parse<T: SettingsSchema>(text: &str) -> T {
    let mut settings = T::default();
    let Some(blob) = extract_block(text, OPTION_SETTINGS_MARKER) else {
        return settings;
    };

    for (key, raw) in split_parameters(blob) {
        if T::field(&key).is_some() {
            if !set_raw(&mut settings, &key, &raw) {
                tracing::debug!("Ignoring unparsable value '{}' for setting '{}'", raw, key);
            }
        } else if !T::STATIC_SETTINGS.iter().any(|(k, _)| *k == key) {
            tracing::debug!("Dropping unknown setting '{}'", key);
        }
    }

    settings
}

/// The flattened, ordered view of a settings value as it will be written.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettingsDocument {
    pub static_settings: Vec<(String, String)>,
    pub mapped: Vec<(String, SettingValue)>,
}

impl SettingsDocument {
    pub fn from_settings<T: SettingsSchema>(settings: &T) -> Self {
        Self {
            static_settings: T::STATIC_SETTINGS
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            mapped: T::fields()
                .iter()
                .map(|f| (f.key.to_string(), (f.get)(settings)))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.static_settings.len() + self.mapped.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &str) -> Option<&SettingValue> {
        self.mapped.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn render(&self, header: &str) -> String {
        let params: Vec<String> = self
            .static_settings
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .chain(self.mapped.iter().map(|(k, v)| format!("{}={}", k, v.format())))
            .collect();

        let mut out = String::new();
        out.push_str(header);
        out.push('\n');
        out.push_str(OPTION_SETTINGS_MARKER);
        out.push_str(&params.join(","));
        out.push_str(")\n");
        out
    }
}

pub fn serialize<T: SettingsSchema>(settings: &T) -> String {
    SettingsDocument::from_settings(settings).render(T::HEADER)
}
