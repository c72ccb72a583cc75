//! The textual `dotted.path=value` key-path payload format used by both
//! FESL and Theater bodies.
//!
//! A [`Payload`] wraps a [`Value`] tree. Callers build request trees with
//! [`Payload::new`] and the `Dict`/`List`/`Map` variants directly (or the
//! small `From` impls below), then serialize with [`Payload::to_bytes`].
//! Response bodies are parsed back into a tree with [`Payload::from_bytes`],
//! optionally re-typing leaves via a [`ParseMap`].

use std::collections::HashMap;

use crate::error::{Error, Result};

/// One node of a payload tree.
///
/// `Dict` and `Map` are kept distinct even though both are string-keyed:
/// a `Dict` is a plain nested structure (`a.b=1`), while a `Map` is a
/// server-provided keyed collection whose keys are wrapped in braces on
/// the wire (`a.{b}=1`) and whose length is recorded explicitly
/// (`a.{}=<n>`), exactly like `List` records its length as `a.[]=<n>`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Dict(Vec<(String, Value)>),
    Map(Vec<(String, Value)>),
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}
impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}
impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Int(v as i64)
    }
}
impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}
impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}
impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl Value {
    pub fn dict() -> Self {
        Value::Dict(Vec::new())
    }

    /// Inserts (or replaces) a child on a `Dict` node. Panics if called on
    /// a non-dict node; only used while building request trees.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        match self {
            Value::Dict(entries) => {
                let key = key.into();
                let value = value.into();
                if let Some(existing) = entries.iter_mut().find(|(k, _)| *k == key) {
                    existing.1 = value;
                } else {
                    entries.push((key, value));
                }
            }
            _ => panic!("Value::insert called on a non-dict node"),
        }
        self
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&[(String, Value)]> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(String, Value)]> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    fn get_path<'a>(&'a self, key: &str) -> Option<&'a Value> {
        match self {
            Value::Dict(entries) | Value::Map(entries) => {
                entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
            }
            _ => None,
        }
    }
}

/// Magic parse-map keys, as distinguished nominal constants rather than
/// plain string literals so they can never collide with a real server
/// field name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParseKey {
    /// A named field (`userId`, `lkey`, ...).
    Field(&'static str),
    /// Matches any numeric list index, so scalar lists can be typed
    /// uniformly without naming every index.
    Index,
    /// Matches any key not otherwise present in the map.
    Fallback,
    /// Matches any key whose value is a `Map` node; overrides `Fallback`
    /// so unknown map-valued keys (e.g. dogtag `values`) are not forced
    /// through the scalar fallback type.
    AnyMap,
}

/// The type a leaf value should be parsed as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Str,
    Int,
    Float,
    Bool,
}

/// An operation-scoped table of leaf types, consulted while normalizing a
/// freshly parsed [`Value`] tree.
#[derive(Debug, Clone, Default)]
pub struct ParseMap {
    fields: HashMap<&'static str, FieldType>,
    index: Option<FieldType>,
    fallback: Option<FieldType>,
    any_map: Option<FieldType>,
}

impl ParseMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: ParseKey, ty: FieldType) -> Self {
        match key {
            ParseKey::Field(name) => {
                self.fields.insert(name, ty);
            }
            ParseKey::Index => self.index = Some(ty),
            ParseKey::Fallback => self.fallback = Some(ty),
            ParseKey::AnyMap => self.any_map = Some(ty),
        }
        self
    }

    fn type_for(&self, key: &str, value: &Value) -> Option<FieldType> {
        if let Some(ty) = self.fields.get(key) {
            return Some(*ty);
        }
        if matches!(value, Value::Map(_)) {
            if let Some(ty) = self.any_map {
                return Some(ty);
            }
        }
        self.fallback
    }
}

/// A parsed/constructed key-path payload tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload(pub Value);

impl Default for Payload {
    fn default() -> Self {
        Payload(Value::dict())
    }
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(value: Value) -> Self {
        Payload(value)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.0.insert(key, value);
        self
    }

    // --- Serialization -----------------------------------------------

    /// Serializes this payload to the `path=value` line format, without
    /// the packet-level trailing `\x00`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut lines = Vec::new();
        serialize_node(&self.0, "", &mut lines);
        lines.join(&b'\n')
    }

    // --- Parsing --------------------------------------------------------

    /// Parses a raw body (as delivered on the wire, `\n`-joined lines,
    /// no parse map applied) into a tree.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::from_bytes_typed(data, &ParseMap::default())
    }

    /// Parses a raw body and applies `parse_map` to re-type leaf scalars.
    pub fn from_bytes_typed(data: &[u8], parse_map: &ParseMap) -> Result<Self> {
        let raw = build_raw_tree(data)?;
        let mut value = normalize(raw)?;
        apply_parse_map(&mut value, parse_map)?;
        Ok(Payload(value))
    }

    // --- Typed accessors --------------------------------------------

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get_path(key)
    }

    pub fn get_str<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).and_then(Value::as_str).unwrap_or(default)
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        self.get(key).and_then(Value::as_int).unwrap_or(default)
    }

    pub fn get_float(&self, key: &str, default: f64) -> f64 {
        match self.get(key) {
            Some(Value::Float(f)) => *f,
            Some(Value::Int(i)) => *i as f64,
            _ => default,
        }
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(Value::Bool(b)) => *b,
            _ => default,
        }
    }

    pub fn get_list(&self, key: &str) -> Option<&[Value]> {
        self.get(key).and_then(Value::as_list)
    }

    pub fn get_dict(&self, key: &str) -> Option<&[(String, Value)]> {
        self.get(key).and_then(Value::as_dict)
    }

    pub fn get_map(&self, key: &str) -> Option<&[(String, Value)]> {
        self.get(key).and_then(Value::as_map)
    }
}

// --- Serialization helpers --------------------------------------------

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn serialize_node(value: &Value, path: &str, lines: &mut Vec<Vec<u8>>) {
    match value {
        Value::Dict(entries) => {
            for (key, child) in entries {
                serialize_node(child, &join_path(path, key), lines);
            }
        }
        Value::Map(entries) => {
            for (key, child) in entries {
                serialize_node(child, &join_path(path, &format!("{{{key}}}")), lines);
            }
            lines.push(format!("{path}.{{}}={}", entries.len()).into_bytes());
        }
        Value::List(items) => {
            for (index, child) in items.iter().enumerate() {
                serialize_node(child, &join_path(path, &index.to_string()), lines);
            }
            lines.push(format!("{path}.[]={}", items.len()).into_bytes());
        }
        scalar => {
            let mut line = path.as_bytes().to_vec();
            line.push(b'=');
            line.extend(serialize_scalar(scalar));
            lines.push(line);
        }
    }
}

fn serialize_scalar(value: &Value) -> Vec<u8> {
    match value {
        Value::Null => Vec::new(),
        Value::Bool(b) => if *b { b"1".to_vec() } else { b"0".to_vec() },
        Value::Int(i) => i.to_string().into_bytes(),
        Value::Float(f) => f.to_string().into_bytes(),
        Value::Str(s) => quote_if_needed(s).into_bytes(),
        _ => unreachable!("serialize_scalar called on a container node"),
    }
}

/// Quotes and percent-encodes a string if it would otherwise contain
/// `=`, `\n`, or any non-ASCII byte; otherwise emits it verbatim. This
/// is the single quoting rule spec.md §9 leaves as an open question.
fn quote_if_needed(s: &str) -> String {
    let needs_quoting = s
        .bytes()
        .any(|b| b == b'=' || b == b'\n' || !b.is_ascii());
    if !needs_quoting {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    out.push_str(&percent_encode(s));
    out.push('"');
    out
}

const PERCENT_SAFE: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_.~";

pub(crate) fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.as_bytes() {
        if PERCENT_SAFE.contains(byte) {
            out.push(*byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

pub(crate) fn percent_decode(s: &str) -> Result<Vec<u8>> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .ok_or_else(|| Error::Protocol(format!("truncated percent-encoding in {s:?}")))?;
            let hex_str = std::str::from_utf8(hex)
                .map_err(|_| Error::Protocol(format!("invalid percent-encoding in {s:?}")))?;
            let byte = u8::from_str_radix(hex_str, 16)
                .map_err(|_| Error::Protocol(format!("invalid percent-encoding in {s:?}")))?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(out)
}

// --- Parsing helpers ---------------------------------------------------

/// Intermediate tree built by the flat-line pass: a key either carries a
/// raw scalar (the bytes after `=`) or further nested children.
enum RawNode {
    Leaf(Vec<u8>),
    Branch(Vec<(String, RawNode)>),
}

impl RawNode {
    fn branch_mut(&mut self) -> &mut Vec<(String, RawNode)> {
        match self {
            RawNode::Branch(entries) => entries,
            RawNode::Leaf(_) => unreachable!("leaf/branch collision in raw payload tree"),
        }
    }
}

fn build_raw_tree(data: &[u8]) -> Result<RawNode> {
    let mut root = RawNode::Branch(Vec::new());
    for line in data.split(|&b| b == b'\n') {
        if line.is_empty() {
            continue;
        }
        let pos = line
            .iter()
            .position(|&b| b == b'=')
            .ok_or_else(|| Error::Protocol(format!("payload line missing '=': {line:?}")))?;
        let key = std::str::from_utf8(&line[..pos])
            .map_err(|_| Error::Protocol("payload key is not valid UTF-8".to_string()))?;
        let value = line[pos + 1..].to_vec();
        insert_raw(&mut root, key.split('.'), value);
    }
    Ok(root)
}

fn insert_raw<'a>(node: &mut RawNode, mut path: impl Iterator<Item = &'a str>, value: Vec<u8>) {
    match path.next() {
        None => *node = RawNode::Leaf(value),
        Some(component) => {
            let entries = node.branch_mut();
            let existing = entries.iter_mut().find(|(k, _)| k == component);
            let child = match existing {
                Some((_, child)) => child,
                None => {
                    entries.push((component.to_string(), RawNode::Branch(Vec::new())));
                    &mut entries.last_mut().unwrap().1
                }
            };
            insert_raw(child, path, value);
        }
    }
}

fn normalize(node: RawNode) -> Result<Value> {
    match node {
        RawNode::Leaf(bytes) => {
            let s = String::from_utf8(bytes)
                .map_err(|_| Error::Protocol("payload leaf is not valid UTF-8".to_string()))?;
            Ok(Value::Str(s))
        }
        RawNode::Branch(entries) => {
            if entries.iter().any(|(k, _)| k == "[]") {
                let length: usize = {
                    let (_, list_len) = entries.iter().find(|(k, _)| k == "[]").unwrap();
                    leaf_as_str(list_len)?
                        .parse()
                        .map_err(|_| Error::Protocol("invalid list length indicator".to_string()))?
                };
                let mut by_key: HashMap<String, RawNode> = entries
                    .into_iter()
                    .filter(|(k, _)| k != "[]")
                    .collect();
                let mut items = Vec::with_capacity(length);
                for i in 0..length {
                    let key = i.to_string();
                    let child = by_key
                        .remove(&key)
                        .ok_or_else(|| Error::Protocol(format!("payload list missing index {i}")))?;
                    items.push(normalize(child)?);
                }
                Ok(Value::List(items))
            } else if entries.iter().any(|(k, _)| k == "{}") {
                let length: usize = {
                    let (_, len_node) = entries.iter().find(|(k, _)| k == "{}").unwrap();
                    leaf_as_str(len_node)?
                        .parse()
                        .map_err(|_| Error::Protocol("invalid map length indicator".to_string()))?
                };
                let mut out = Vec::with_capacity(length);
                for (key, child) in entries {
                    if key == "{}" {
                        continue;
                    }
                    let stripped = key.trim_start_matches('{').trim_end_matches('}').to_string();
                    out.push((stripped, normalize(child)?));
                }
                if out.len() != length {
                    return Err(Error::Protocol(format!(
                        "payload map declared {length} entries but found {}",
                        out.len()
                    )));
                }
                Ok(Value::Map(out))
            } else {
                let mut out = Vec::with_capacity(entries.len());
                for (key, child) in entries {
                    out.push((key, normalize(child)?));
                }
                Ok(Value::Dict(out))
            }
        }
    }
}

fn leaf_as_str(node: &RawNode) -> Result<&str> {
    match node {
        RawNode::Leaf(bytes) => std::str::from_utf8(bytes)
            .map_err(|_| Error::Protocol("payload leaf is not valid UTF-8".to_string())),
        RawNode::Branch(_) => Err(Error::Protocol(
            "expected a scalar length indicator, found a nested structure".to_string(),
        )),
    }
}

fn apply_parse_map(value: &mut Value, parse_map: &ParseMap) -> Result<()> {
    apply_parse_map_inner(value, "", parse_map)
}

fn apply_parse_map_inner(value: &mut Value, key: &str, parse_map: &ParseMap) -> Result<()> {
    match value {
        Value::Str(_) => {
            if let Some(ty) = parse_map.type_for(key, value) {
                retype_leaf(value, ty, key)?;
            }
        }
        Value::Dict(entries) => {
            for (child_key, child) in entries.iter_mut() {
                apply_parse_map_inner(child, child_key, parse_map)?;
            }
        }
        Value::Map(entries) => {
            let entry_ty = parse_map.type_for(key, value);
            for (child_key, child) in entries.iter_mut() {
                match entry_ty {
                    Some(ty) if matches!(child, Value::Str(_)) => retype_leaf(child, ty, child_key)?,
                    _ => apply_parse_map_inner(child, child_key, parse_map)?,
                }
            }
        }
        Value::List(items) => {
            for item in items.iter_mut() {
                match item {
                    Value::Str(_) => {
                        if let Some(ty) = parse_map.index {
                            retype_leaf(item, ty, key)?;
                        }
                    }
                    _ => apply_parse_map_inner(item, key, parse_map)?,
                }
            }
        }
        Value::Null | Value::Bool(_) | Value::Int(_) | Value::Float(_) => {}
    }
    Ok(())
}

fn retype_leaf(value: &mut Value, ty: FieldType, key: &str) -> Result<()> {
    let raw = match value {
        Value::Str(s) => s.clone(),
        _ => return Ok(()),
    };
    *value = match ty {
        FieldType::Str => {
            let unquoted = raw
                .strip_prefix('"')
                .and_then(|s| s.strip_suffix('"'))
                .unwrap_or(&raw);
            let decoded = percent_decode(unquoted)?;
            Value::Str(
                String::from_utf8(decoded)
                    .map_err(|_| Error::Protocol(format!("field {key} is not valid UTF-8")))?,
            )
        }
        FieldType::Int => Value::Int(
            raw.parse()
                .map_err(|_| Error::Protocol(format!("field {key} is not a valid integer: {raw}")))?,
        ),
        FieldType::Float => Value::Float(
            raw.parse()
                .map_err(|_| Error::Protocol(format!("field {key} is not a valid float: {raw}")))?,
        ),
        FieldType::Bool => match raw.as_str() {
            "1" | "YES" => Value::Bool(true),
            "0" | "NO" => Value::Bool(false),
            other => {
                return Err(Error::Protocol(format!(
                    "field {key} is not a valid boolean: {other}"
                )))
            }
        },
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_scalar_dict() {
        let mut payload = Payload::new();
        payload.insert("TXN", "Hello").insert("fragmentSize", 8096i64);
        let bytes = payload.to_bytes();
        let parsed = Payload::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.get_str("TXN", ""), "Hello");
        assert_eq!(parsed.get_str("fragmentSize", ""), "8096");
    }

    #[test]
    fn parses_user_lookup_response() {
        let body = b"userInfo.0.namespace=PS3_SUB\nuserInfo.0.userId=891451503\nTXN=LookupUserInfo\nuserInfo.0.xuid=8030785869539906380\nuserInfo.0.userName=sam707\nuserInfo.[]=1";
        let parse_map = ParseMap::new()
            .with(ParseKey::Field("userId"), FieldType::Int)
            .with(ParseKey::Field("xuid"), FieldType::Int)
            .with(ParseKey::Fallback, FieldType::Str);
        let payload = Payload::from_bytes_typed(body, &parse_map).unwrap();
        assert_eq!(payload.get_str("TXN", ""), "LookupUserInfo");
        let list = payload.get_list("userInfo").unwrap();
        assert_eq!(list.len(), 1);
        let entry = list[0].as_dict().unwrap();
        let get = |k: &str| entry.iter().find(|(key, _)| key == k).unwrap().1.clone();
        assert_eq!(get("namespace"), Value::Str("PS3_SUB".to_string()));
        assert_eq!(get("userId"), Value::Int(891451503));
        assert_eq!(get("userName"), Value::Str("sam707".to_string()));
    }

    #[test]
    fn parses_dogtag_map_and_unquotes_timestamp() {
        let body = "values.{992138898}=UkVTUEFXTiBPTzcAAAAAAEWzfpIAARkA\nvalues.{}=1\nlastModified=\"2023-09-22 19%3a42%3a57.0\"";
        let parse_map = ParseMap::new().with(ParseKey::Field("lastModified"), FieldType::Str);
        let payload = Payload::from_bytes_typed(body.as_bytes(), &parse_map).unwrap();
        let map = payload.get_map("values").unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(
            payload.get_str("lastModified", ""),
            "2023-09-22 19:42:57.0"
        );
    }

    #[test]
    fn leaderboard_addstats_list_of_pairs() {
        let body = "stats.0.addStats.0.key=kills\nstats.0.addStats.0.value=10\nstats.0.addStats.[]=1\nstats.[]=1";
        let payload = Payload::from_bytes(body.as_bytes()).unwrap();
        let stats = payload.get_list("stats").unwrap();
        let entry = stats[0].as_dict().unwrap();
        let add_stats = entry
            .iter()
            .find(|(k, _)| k == "addStats")
            .unwrap()
            .1
            .as_list()
            .unwrap();
        assert_eq!(add_stats.len(), 1);
    }

    #[test]
    fn list_length_mismatch_is_protocol_error() {
        let body = b"a.[]=2\na.0=x";
        assert!(Payload::from_bytes(body).is_err());
    }

    #[test]
    fn quotes_values_containing_equals_or_newline() {
        assert_eq!(quote_if_needed("plain"), "plain");
        assert_eq!(quote_if_needed("a=b"), "\"a%3Db\"");
    }
}
