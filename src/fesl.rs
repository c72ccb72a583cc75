//! FESL session: hello/memcheck/login handshake, the `wrapped_read`
//! auto-respond primitive, and every account/stats/leaderboard/dogtag
//! operation.

use std::collections::HashMap;
use std::time::Duration;

use base64ct::{Base64, Encoding};
use log::debug;

use crate::constants::{Namespace, Platform, FRAGMENT_SIZE};
use crate::dogtag::{self, DogtagRecord};
use crate::error::{Error, NotFoundKind, Result};
use crate::packet::{Body, FeslPacket, FeslTransmissionType};
use crate::payload::{percent_decode, percent_encode, FieldType, ParseKey, ParseMap, Payload, Value};
use crate::transport::{dial_fesl, Transport};

use blaze_ssl_async::BlazeStream;

/// Idempotent session steps; re-entering a completed step returns the
/// cached response without I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum FeslStep {
    Hello,
    Login,
}

/// Which `userInfo`/search field a batch lookup keys its identifiers by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupType {
    ByName,
    ById,
}

impl LookupType {
    fn field(self) -> &'static str {
        match self {
            LookupType::ByName => "userName",
            LookupType::ById => "userId",
        }
    }
}

/// Result of [`FeslClient::search_name`].
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub namespace: String,
    pub users: Vec<Value>,
}

/// FESL client. Owns one TLS connection; operations are `&mut self` so
/// the borrow checker statically prevents two callers interleaving
/// transaction ids on the same connection.
///
/// `username`/`password`/`use_nulogin` are stored at construction
/// (mirroring the ground-truth client, which stashes all three in
/// `__init__`) so that every public operation requiring an authenticated
/// session can silently call [`FeslClient::login`] as its required
/// predecessor instead of forcing the caller to sequence `login` first.
pub struct FeslClient {
    transport: Transport<BlazeStream>,
    client_string: &'static str,
    platform: Platform,
    username: String,
    password: String,
    use_nulogin: bool,
    next_tid: u32,
    completed: HashMap<FeslStep, FeslPacket>,
}

fn fesl_body_len(header: &[u8; crate::constants::HEADER_LENGTH]) -> Result<usize> {
    let total = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
    total
        .checked_sub(crate::constants::HEADER_LENGTH)
        .ok_or_else(|| Error::Protocol("packet header is not valid".to_string()))
}

impl FeslClient {
    pub async fn connect(
        host: &str,
        port: u16,
        platform: Platform,
        client_string: &'static str,
        username: impl Into<String>,
        password: impl Into<String>,
        use_nulogin: bool,
        timeout: Duration,
    ) -> Result<Self> {
        let transport = dial_fesl(host, port, timeout).await?;
        Ok(FeslClient {
            transport,
            client_string,
            platform,
            username: username.into(),
            password: password.into(),
            use_nulogin,
            next_tid: 0,
            completed: HashMap::new(),
        })
    }

    fn next_tid(&mut self) -> u32 {
        self.next_tid += 1;
        self.next_tid
    }

    async fn send(&mut self, packet: &FeslPacket) -> Result<()> {
        self.transport.write_all(&packet.to_bytes()).await
    }

    async fn read_one(&mut self) -> Result<FeslPacket> {
        let (header, body) = self.transport.read_packet(fesl_body_len).await?;
        let packet = FeslPacket::from_parts(header, body);
        packet.validate_header()?;
        packet.validate_body()?;
        Ok(packet)
    }

    /// Reads one packet, transparently answering `MemCheck`/`Ping` prompts
    /// and dropping any reply whose transaction id belongs to a
    /// transaction the caller has already abandoned.
    async fn wrapped_read(&mut self, tid: u32) -> Result<FeslPacket> {
        loop {
            let packet = self.read_one().await?;
            let body = Payload::from_bytes(packet.data())?;
            let txn = body.get_str("TXN", "");

            if txn == "MemCheck" {
                self.memcheck().await?;
                continue;
            }
            if txn == "Ping" {
                self.ping().await?;
                continue;
            }
            if packet.tid() < tid {
                continue;
            }
            return Ok(packet);
        }
    }

    // --- Session handshake --------------------------------------------

    pub async fn hello(&mut self) -> Result<()> {
        if self.completed.contains_key(&FeslStep::Hello) {
            return Ok(());
        }

        let tid = self.next_tid();
        let mut payload = Payload::new();
        payload
            .insert("TXN", "Hello")
            .insert("clientString", self.client_string)
            .insert("sku", "PC")
            .insert("locale", "en_US")
            .insert("clientPlatform", "PC")
            .insert("clientVersion", "2.0")
            .insert("SDKVersion", "5.1.2.0.0")
            .insert("protocolVersion", "2.0")
            .insert("fragmentSize", FRAGMENT_SIZE as i64)
            .insert("clientType", "server");

        let packet = FeslPacket::build(b"fsys", Body::Payload(&payload), FeslTransmissionType::SinglePacketRequest, Some(tid));
        self.send(&packet).await?;

        // The hello response is immediately followed by an unsolicited
        // initial MemCheck; read both before replying.
        let response = self.read_one().await?;
        let _initial_memcheck = self.read_one().await?;

        self.completed.insert(FeslStep::Hello, response);
        self.memcheck().await?;
        Ok(())
    }

    pub async fn memcheck(&mut self) -> Result<()> {
        let mut payload = Payload::new();
        payload.insert("TXN", "MemCheck").insert("result", "");
        let packet = FeslPacket::build(b"fsys", Body::Payload(&payload), FeslTransmissionType::SinglePacketResponse, None);
        self.send(&packet).await
    }

    pub async fn ping(&mut self) -> Result<()> {
        let mut payload = Payload::new();
        payload.insert("TXN", "Ping");
        let packet = FeslPacket::build(b"fsys", Body::Payload(&payload), FeslTransmissionType::SinglePacketResponse, None);
        self.send(&packet).await
    }

    pub async fn login(&mut self) -> Result<()> {
        if self.completed.contains_key(&FeslStep::Login) {
            return Ok(());
        }
        self.hello().await?;

        let tid = self.next_tid();
        let mut payload = Payload::new();
        payload
            .insert("TXN", if self.use_nulogin { "NuLogin" } else { "Login" })
            .insert("returnEncryptedInfo", 0i64)
            .insert("name", self.username.clone())
            .insert("password", self.password.clone())
            .insert("macAddr", "$000000000000");

        let packet = FeslPacket::build(b"acct", Body::Payload(&payload), FeslTransmissionType::SinglePacketRequest, Some(tid));
        self.send(&packet).await?;
        let response = self.wrapped_read(tid).await?;

        let parsed = Payload::from_bytes(response.data())?;
        if parsed.get("lkey").is_none() {
            let message = parsed.get_str("localizedMessage", "");
            return Err(Error::Auth(message.to_string()));
        }

        self.completed.insert(FeslStep::Login, response);
        Ok(())
    }

    pub async fn logout(&mut self) -> Result<()> {
        if !self.completed.contains_key(&FeslStep::Login) {
            return Ok(());
        }
        let tid = self.next_tid();
        let mut payload = Payload::new();
        payload
            .insert("TXN", "Goodbye")
            .insert("reason", "GOODBYE_CLIENT_NORMAL")
            .insert("message", "\"Disconnected via front-end\"");
        let packet = FeslPacket::build(b"fsys", Body::Payload(&payload), FeslTransmissionType::SinglePacketRequest, Some(tid));
        self.send(&packet).await?;
        self.completed.clear();
        let _ = self.wrapped_read(tid).await?;
        Ok(())
    }

    /// The Theater backend a caller should connect to next, read from the
    /// cached `hello` response (`theaterIp` is in fact a hostname).
    pub async fn get_theater_details(&mut self) -> Result<(String, u16)> {
        self.hello().await?;
        let packet = self.completed.get(&FeslStep::Hello).expect("hello() populates this");
        let payload = Payload::from_bytes(packet.data())?;
        Ok((
            payload.get_str("theaterIp", "").to_string(),
            payload.get_int("theaterPort", 0) as u16,
        ))
    }

    pub async fn get_lkey(&mut self) -> Result<String> {
        self.login().await?;
        let packet = self.completed.get(&FeslStep::Login).expect("login() populates this");
        let payload = Payload::from_bytes(packet.data())?;
        Ok(payload.get_str("lkey", "").to_string())
    }

    // --- Lookup / search -------------------------------------------------

    fn user_lookup_parse_map() -> ParseMap {
        ParseMap::new()
            .with(ParseKey::Field("userId"), FieldType::Int)
            .with(ParseKey::Field("xuid"), FieldType::Int)
            .with(ParseKey::Fallback, FieldType::Str)
    }

    pub async fn lookup_user_identifiers(
        &mut self,
        identifiers: &[LookupIdentifier],
        namespace: Namespace,
        lookup_type: LookupType,
    ) -> Result<Vec<Value>> {
        self.login().await?;
        let tid = self.next_tid();

        let entries = identifiers
            .iter()
            .map(|identifier| {
                let mut entry = Value::dict();
                entry.insert(lookup_type.field(), identifier.clone());
                entry.insert("namespace", namespace.as_str());
                entry
            })
            .collect();

        let txn = if namespace.is_legacy() { "LookupUserInfo" } else { "NuLookupUserInfo" };
        let mut payload = Payload::new();
        payload.insert("TXN", txn).insert("userInfo", Value::List(entries));

        let packet = FeslPacket::build(b"acct", Body::Payload(&payload), FeslTransmissionType::SinglePacketRequest, Some(tid));
        self.send(&packet).await?;

        let response = self.get_response(tid, &Self::user_lookup_parse_map()).await?;
        Ok(response
            .get_list("userInfo")
            .map(|list| list.to_vec())
            .unwrap_or_default())
    }

    pub async fn lookup_user_identifier(
        &mut self,
        identifier: LookupIdentifier,
        namespace: Namespace,
        lookup_type: LookupType,
    ) -> Result<Value> {
        let mut results = self.lookup_user_identifiers(&[identifier], namespace, lookup_type).await?;
        results.pop().ok_or(Error::NotFound(NotFoundKind::Player))
    }

    pub async fn lookup_username(&mut self, username: &str, namespace: Namespace) -> Result<Value> {
        self.lookup_user_identifier(LookupIdentifier::Name(username.to_string()), namespace, LookupType::ByName)
            .await
    }

    pub async fn lookup_user_id(&mut self, user_id: i64, namespace: Namespace) -> Result<Value> {
        self.lookup_user_identifier(LookupIdentifier::Id(user_id), namespace, LookupType::ById)
            .await
    }

    pub async fn search_name(&mut self, screen_name: &str, namespace: Namespace) -> Result<SearchResult> {
        self.login().await?;
        let tid = self.next_tid();

        let legacy = namespace.is_legacy();
        let mut payload = Payload::new();
        payload
            .insert("TXN", if legacy { "SearchOwners" } else { "NuSearchOwners" })
            .insert("screenName", screen_name)
            .insert("searchType", 1i64)
            .insert("retrieveUserIds", if legacy { 1i64 } else { 0i64 })
            .insert("nameSpaceId", namespace.as_str());

        let packet = FeslPacket::build(b"acct", Body::Payload(&payload), FeslTransmissionType::SinglePacketRequest, Some(tid));
        self.send(&packet).await?;

        let response = self.get_response(tid, &Self::user_lookup_parse_map()).await?;
        Ok(SearchResult {
            namespace: response.get_str("nameSpaceId", "").to_string(),
            users: response.get_list("users").map(|l| l.to_vec()).unwrap_or_default(),
        })
    }

    // --- Stats / leaderboard / dogtags ----------------------------------

    fn stats_parse_map() -> ParseMap {
        ParseMap::new()
            .with(ParseKey::Field("key"), FieldType::Str)
            .with(ParseKey::Field("value"), FieldType::Float)
            .with(ParseKey::Fallback, FieldType::Str)
    }

    /// Issues `GetStats`, transparently switching to the chunked
    /// multi-packet protocol when the request body exceeds
    /// [`FRAGMENT_SIZE`]. Returns a flattened `{key: value}` map built
    /// from the response's `stats` list of `{key, value}` pairs.
    pub async fn get_stats(&mut self, user_id: i64, keys: &[&str]) -> Result<Vec<(String, Value)>> {
        self.login().await?;
        let tid = self.next_tid();

        let mut payload = Payload::new();
        payload
            .insert("TXN", "GetStats")
            .insert("owner", user_id)
            .insert("ownerType", 1i64)
            .insert("periodId", 0i64)
            .insert("periodPast", 0i64)
            .insert("keys", Value::List(keys.iter().map(|k| Value::from(*k)).collect()));

        let body = payload.to_bytes();
        if body.len() <= FRAGMENT_SIZE {
            let packet = FeslPacket::build(b"rank", Body::Raw(&body), FeslTransmissionType::SinglePacketRequest, Some(tid));
            self.send(&packet).await?;
        } else {
            self.send_chunked(b"rank", &body, tid).await?;
        }

        let response = self.get_response(tid, &Self::stats_parse_map()).await?;
        let list = response.get_list("stats").map(|l| l.to_vec()).unwrap_or_default();
        dict_list_to_dict(&list)
    }

    /// Splits `body` into base64+percent-encoded `size=/data=` chunks of
    /// at most [`FRAGMENT_SIZE`] bytes, sent as multi-packet requests
    /// sharing `tid`.
    async fn send_chunked(&mut self, tag: &[u8; 4], body: &[u8], tid: u32) -> Result<()> {
        let mut with_trailer = body.to_vec();
        with_trailer.push(0);
        let encoded = Base64::encode_string(&with_trailer);
        let size = encoded.len().to_string();
        let quoted = percent_encode(&encoded);

        let chunks = quoted.as_bytes().chunks(FRAGMENT_SIZE);
        for chunk in chunks {
            let chunk_text = std::str::from_utf8(chunk)
                .map_err(|_| Error::Protocol("chunked stats body is not valid UTF-8".to_string()))?;
            let mut chunk_payload = Payload::new();
            chunk_payload.insert("size", size.as_str()).insert("data", chunk_text);
            let packet = FeslPacket::build(tag, Body::Payload(&chunk_payload), FeslTransmissionType::MultiPacketRequest, Some(tid));
            self.send(&packet).await?;
        }
        Ok(())
    }

    pub async fn get_leaderboard(
        &mut self,
        min_rank: i64,
        max_rank: i64,
        sort_by: &str,
        keys: &[&str],
    ) -> Result<Vec<Vec<(String, Value)>>> {
        self.login().await?;
        let tid = self.next_tid();

        let mut payload = Payload::new();
        payload
            .insert("TXN", "GetTopNAndStats")
            .insert("key", sort_by)
            .insert("ownerType", 1i64)
            .insert("minRank", min_rank)
            .insert("maxRank", max_rank)
            .insert("periodId", 0i64)
            .insert("periodPast", 0i64)
            .insert("rankOrder", 0i64)
            .insert("keys", Value::List(keys.iter().map(|k| Value::from(*k)).collect()));

        let packet = FeslPacket::build(b"rank", Body::Payload(&payload), FeslTransmissionType::SinglePacketRequest, Some(tid));
        self.send(&packet).await?;

        let response = self.get_response(tid, &Self::stats_parse_map()).await?;
        let entries = response.get_list("stats").map(|l| l.to_vec()).unwrap_or_default();

        entries
            .into_iter()
            .map(|entry| {
                let dict = entry
                    .as_dict()
                    .ok_or_else(|| Error::Protocol("leaderboard entry is not a dict".to_string()))?;
                dict.iter()
                    .map(|(key, value)| match value {
                        Value::List(pairs) => Ok((key.clone(), Value::Dict(dict_list_to_dict(pairs)?))),
                        other => Ok((key.clone(), other.clone())),
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect()
    }

    pub async fn get_dogtags(&mut self, user_id: i64) -> Result<Vec<DogtagRecord>> {
        self.login().await?;
        let tid = self.next_tid();

        let mut payload = Payload::new();
        payload
            .insert("TXN", "GetRecordAsMap")
            .insert("recordName", "dogtags")
            .insert("owner", user_id);

        let packet = FeslPacket::build(b"recp", Body::Payload(&payload), FeslTransmissionType::SinglePacketRequest, Some(tid));
        self.send(&packet).await?;

        let parse_map = ParseMap::new().with(ParseKey::Fallback, FieldType::Str);
        let response = self.get_response(tid, &parse_map).await?;
        let values = response.get_map("values").unwrap_or(&[]);

        values
            .iter()
            .map(|(owner_id, value)| {
                let encoded = value
                    .as_str()
                    .ok_or_else(|| Error::Protocol("dogtag record is not a string".to_string()))?;
                let decoded = Base64::decode_vec(encoded)
                    .map_err(|_| Error::Protocol(format!("dogtag record {owner_id} is not valid base64")))?;
                dogtag::decode_record(owner_id, &decoded, self.platform)
            })
            .collect()
    }

    // --- Multi-packet response reassembly -------------------------------

    /// Reads packets for transaction `tid` until the response is fully
    /// reassembled, then parses the accumulated bytes with `parse_map`.
    async fn get_response(&mut self, tid: u32, parse_map: &ParseMap) -> Result<Payload> {
        let mut response = Vec::new();
        loop {
            let packet = self.wrapped_read(tid).await?;
            let (data, last) = self.process_response_packet(&packet)?;
            response.extend_from_slice(&data);
            if last {
                break;
            }
        }
        Payload::from_bytes_typed(&response, parse_map)
    }

    /// Checks a response packet for an `errorCode`, maps it to the §7
    /// taxonomy, and otherwise returns its contribution to the
    /// reassembled response body plus whether it was the final chunk.
    fn process_response_packet(&self, packet: &FeslPacket) -> Result<(Vec<u8>, bool)> {
        let transmission_type = packet.transmission_type()?;
        let payload = Payload::from_bytes(packet.data())?;

        if let Some(code_str) = payload.get("errorCode").and_then(Value::as_str) {
            let code: i64 = code_str
                .parse()
                .map_err(|_| Error::Protocol(format!("non-numeric errorCode {code_str}")))?;
            let txn = payload.get_str("TXN", "");
            let message = payload.get_str("localizedMessage", "").to_string();
            return Err(map_fesl_error(code, txn, message));
        }

        if !matches!(
            transmission_type,
            FeslTransmissionType::SinglePacketResponse | FeslTransmissionType::MultiPacketResponse
        ) {
            return Err(Error::Protocol("FESL returned invalid response".to_string()));
        }

        if transmission_type == FeslTransmissionType::MultiPacketResponse {
            let chunk = payload.get_str("data", "");
            let decoded_percent = percent_decode(chunk)?;
            let text = std::str::from_utf8(&decoded_percent)
                .map_err(|_| Error::Protocol("chunk is not valid UTF-8".to_string()))?;
            let mut data = Base64::decode_vec(text)
                .map_err(|_| Error::Protocol("chunk is not valid base64".to_string()))?;
            let last = data.last() == Some(&0);
            if last {
                data.pop();
            }
            return Ok((data, last));
        }

        Ok((packet.data().to_vec(), true))
    }
}

/// Either form a batched lookup can take.
#[derive(Debug, Clone)]
pub enum LookupIdentifier {
    Name(String),
    Id(i64),
}

impl From<LookupIdentifier> for Value {
    fn from(identifier: LookupIdentifier) -> Self {
        match identifier {
            LookupIdentifier::Name(name) => Value::Str(name),
            LookupIdentifier::Id(id) => Value::Int(id),
        }
    }
}

fn map_fesl_error(code: i64, txn: &str, message: String) -> Error {
    match (code, txn) {
        (21, _) => Error::Parameter(message),
        (101, "NuLookupUserInfo") => Error::NotFound(NotFoundKind::Player),
        (101, "NuSearchOwners") => Error::Search,
        (104, "NuSearchOwners") => Error::Search,
        (223, "SearchOwners") => Error::Search,
        (5000, txn) if txn.starts_with("GetRecord") => Error::NotFound(NotFoundKind::Record),
        _ => Error::Protocol(format!("FESL returned an error: {message} (code {code})")),
    }
}

/// `sorted(list, key=key).then {entry.key: entry.value}` — used for both
/// `GetStats` and the inner `addStats` sub-lists of a leaderboard entry.
fn dict_list_to_dict(entries: &[Value]) -> Result<Vec<(String, Value)>> {
    let mut pairs = entries
        .iter()
        .map(|entry| {
            let dict = entry
                .as_dict()
                .ok_or_else(|| Error::Protocol("stats entry is not a dict".to_string()))?;
            let key = dict
                .iter()
                .find(|(k, _)| k == "key")
                .and_then(|(_, v)| v.as_str())
                .ok_or_else(|| Error::Protocol("stats entry missing key".to_string()))?
                .to_string();
            let value = dict
                .iter()
                .find(|(k, _)| k == "value")
                .map(|(_, v)| v.clone())
                .unwrap_or(Value::Null);
            Ok((key, value))
        })
        .collect::<Result<Vec<_>>>()?;
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_fesl_error_codes() {
        assert!(matches!(map_fesl_error(21, "Login", String::new()), Error::Parameter(_)));
        assert!(matches!(
            map_fesl_error(101, "NuLookupUserInfo", String::new()),
            Error::NotFound(NotFoundKind::Player)
        ));
        assert!(matches!(map_fesl_error(104, "NuSearchOwners", String::new()), Error::Search));
        assert!(matches!(map_fesl_error(223, "SearchOwners", String::new()), Error::Search));
        assert!(matches!(
            map_fesl_error(5000, "GetRecordAsMap", String::new()),
            Error::NotFound(NotFoundKind::Record)
        ));
        assert!(matches!(map_fesl_error(9999, "Whatever", "oops".to_string()), Error::Protocol(_)));
    }

    #[test]
    fn dict_list_to_dict_sorts_and_extracts() {
        let mut kills = Value::dict();
        kills.insert("key", "kills");
        kills.insert("value", "10");
        let mut deaths = Value::dict();
        deaths.insert("key", "deaths");
        deaths.insert("value", "5");
        let list = vec![kills, deaths];
        let result = dict_list_to_dict(&list).unwrap();
        assert_eq!(result[0].0, "deaths");
        assert_eq!(result[1].0, "kills");
    }
}
