// ActionCommand: workflow commands printed by steps.
// Parses both wire formats, `##[name k=v;k2=v2]data` (v1) and
// `::name k=v,k2=v2::data` (v2), and encodes commands back into either one.

use std::collections::HashSet;
use std::fmt;

/// The v1 command prefix.
pub const V1_PREFIX: &str = "##[";

/// The v2 command delimiter, used both as prefix and as separator.
pub const V2_COMMAND_KEY: &str = "::";

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

/// Command properties in the order they were written.
///
/// Keys are compared case-insensitively; writing an existing key replaces its
/// value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandProperties {
    entries: Vec<(String, String)>,
}

impl CommandProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&key)) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let index = self.entries.iter().position(|(k, _)| k.eq_ignore_ascii_case(key))?;
        Some(self.entries.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for CommandProperties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut properties = Self::new();
        for (k, v) in iter {
            properties.insert(k, v);
        }
        properties
    }
}

// ---------------------------------------------------------------------------
// Escape tables
// ---------------------------------------------------------------------------

/// `(literal, encoded)` pairs. Decoding is one left-to-right scan, so the
/// output of one replacement is never decoded again.
type EscapeTable = &'static [(char, &'static str)];

const V1_ESCAPES: EscapeTable = &[
    (';', "%3B"),
    ('\r', "%0D"),
    ('\n', "%0A"),
    (']', "%5D"),
    ('%', "%25"),
];

const V2_ESCAPES: EscapeTable = &[
    ('\r', "%0D"),
    ('\n', "%0A"),
    (':', "%3A"),
    (',', "%2C"),
    ('%', "%25"),
];

/// Payload encoding for v2. `:` and `,` are safe after the closing `::`.
const V2_DATA_ESCAPES: EscapeTable = &[('\r', "%0D"), ('\n', "%0A"), ('%', "%25")];

fn unescape(value: &str, table: EscapeTable) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let candidate = &rest[pos..];
        match table.iter().find(|(_, encoded)| candidate.starts_with(encoded)) {
            Some((literal, encoded)) => {
                out.push(*literal);
                rest = &candidate[encoded.len()..];
            }
            None => {
                out.push('%');
                rest = &candidate[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn escape(value: &str, table: EscapeTable) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match table.iter().find(|(literal, _)| *literal == ch) {
            Some((_, encoded)) => out.push_str(encoded),
            None => out.push(ch),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// ActionCommand
// ---------------------------------------------------------------------------

/// A parsed workflow command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionCommand {
    /// The command name as written (e.g. "error", "set-output").
    pub command: String,
    pub properties: CommandProperties,
    /// The payload after the command header.
    pub data: String,
}

impl ActionCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key, value);
        self
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = data.into();
        self
    }

    /// Parse `line` as v1 first, then as v2.
    pub fn try_parse(line: &str, registered_commands: &HashSet<String>) -> Option<ActionCommand> {
        Self::try_parse_v1(line, registered_commands)
            .or_else(|| Self::try_parse_v2(line, registered_commands))
    }

    /// Parse `##[name k=v;k2=v2]data`.
    ///
    /// The `##[` token may follow arbitrary text. `registered_commands` holds
    /// lowercase names.
    pub fn try_parse_v1(
        line: &str,
        registered_commands: &HashSet<String>,
    ) -> Option<ActionCommand> {
        let prefix_index = line.find(V1_PREFIX)?;
        let cmd_start = prefix_index + V1_PREFIX.len();
        let rb_index = cmd_start + line[cmd_start..].find(']')?;

        let cmd_info = &line[cmd_start..rb_index];
        let (name, properties) = split_command_info(cmd_info);
        if !is_registered(name, registered_commands) {
            return None;
        }

        let mut command = ActionCommand::new(name);
        if let Some(properties) = properties {
            parse_properties(properties, ';', V1_ESCAPES, &mut command.properties);
        }
        command.data = unescape(&line[rb_index + 1..], V1_ESCAPES);
        Some(command)
    }

    /// Parse `::name k=v,k2=v2::data`.
    ///
    /// Only leading whitespace may precede the opening `::`.
    pub fn try_parse_v2(
        line: &str,
        registered_commands: &HashSet<String>,
    ) -> Option<ActionCommand> {
        let line = line.trim_start();
        let after_prefix = line.strip_prefix(V2_COMMAND_KEY)?;
        let end_index = after_prefix.find(V2_COMMAND_KEY)?;

        let cmd_info = &after_prefix[..end_index];
        let (name, properties) = split_command_info(cmd_info);
        if !is_registered(name, registered_commands) {
            return None;
        }

        let mut command = ActionCommand::new(name);
        if let Some(properties) = properties {
            parse_properties(properties.trim(), ',', V2_ESCAPES, &mut command.properties);
        }
        command.data = unescape(&after_prefix[end_index + V2_COMMAND_KEY.len()..], V2_ESCAPES);
        Some(command)
    }

    /// Encode in the v1 format.
    pub fn to_v1_string(&self) -> String {
        let mut out = format!("{V1_PREFIX}{}", self.command);
        if !self.properties.is_empty() {
            out.push(' ');
            for (key, value) in self.properties.iter() {
                out.push_str(&format!("{key}={};", escape(value, V1_ESCAPES)));
            }
        }
        out.push(']');
        out.push_str(&escape(&self.data, V1_ESCAPES));
        out
    }

    /// Encode in the v2 format.
    pub fn to_v2_string(&self) -> String {
        let mut out = format!("{V2_COMMAND_KEY}{}", self.command);
        if !self.properties.is_empty() {
            let properties: Vec<String> = self
                .properties
                .iter()
                .map(|(key, value)| format!("{key}={}", escape(value, V2_ESCAPES)))
                .collect();
            out.push(' ');
            out.push_str(&properties.join(","));
        }
        out.push_str(V2_COMMAND_KEY);
        out.push_str(&escape(&self.data, V2_DATA_ESCAPES));
        out
    }
}

impl fmt::Display for ActionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_v2_string())
    }
}

fn split_command_info(cmd_info: &str) -> (&str, Option<&str>) {
    match cmd_info.find(' ') {
        Some(space) => (&cmd_info[..space], Some(&cmd_info[space + 1..])),
        None => (cmd_info, None),
    }
}

fn is_registered(name: &str, registered_commands: &HashSet<String>) -> bool {
    !name.is_empty() && registered_commands.contains(&name.to_lowercase())
}

fn parse_properties(
    raw: &str,
    separator: char,
    table: EscapeTable,
    properties: &mut CommandProperties,
) {
    for entry in raw.split(separator) {
        let Some((key, value)) = entry.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() || value.is_empty() {
            continue;
        }
        properties.insert(key, unescape(value, table));
    }
}
