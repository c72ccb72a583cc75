//! Theater session: `CONN`/`USER` handshake, the `wrapped_read` auto-respond
//! primitive (Theater's only unsolicited prompt is `PING`), and the
//! lobby/server/roster enumeration operations.

use std::collections::HashMap;
use std::time::Duration;

use log::debug;

use crate::error::{Error, NotFoundKind, Result};
use crate::packet::{Body, TheaterPacket, TheaterTransmissionType};
use crate::payload::{FieldType, ParseKey, ParseMap, Payload};
use crate::transport::{dial_theater, Transport};

use tokio::net::TcpStream;

/// Idempotent session steps; re-entering a completed step returns the
/// cached response without I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TheaterStep {
    Conn,
    User,
}

/// Either form [`TheaterClient::get_gdat`] accepts, funneled into the same
/// `GDAT` packet builder (spec.md §9's "dynamic kwargs become a tagged
/// variant" design note).
#[derive(Debug, Clone, Copy)]
pub enum GdatQuery {
    LobbyGame { lobby_id: i64, game_id: i64 },
    CurrentServerOf { user_id: i64 },
}

/// `(GDAT, GDET, active-player PDAT packets)` as returned by
/// [`TheaterClient::get_server_details`] / [`TheaterClient::get_current_server`].
pub struct ServerDetails {
    pub gdat: Payload,
    pub gdet: Payload,
    pub players: Vec<Payload>,
}

/// Theater client. Owns one plaintext TCP connection; operations are
/// `&mut self`, so the borrow checker statically prevents two callers
/// interleaving transaction ids on the same connection.
///
/// `client_string`/`lkey` are stored at construction (mirroring the
/// ground-truth client, which stashes both in `__init__`) so that every
/// public operation can silently call [`TheaterClient::authenticate`] as
/// its required predecessor instead of forcing the caller to sequence
/// `connect_handshake`/`authenticate` manually.
pub struct TheaterClient {
    transport: Transport<TcpStream>,
    client_string: String,
    lkey: String,
    next_tid: u32,
    completed: HashMap<TheaterStep, TheaterPacket>,
}

fn theater_body_len(header: &[u8; crate::constants::HEADER_LENGTH]) -> Result<usize> {
    let total = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
    total
        .checked_sub(crate::constants::HEADER_LENGTH)
        .ok_or_else(|| Error::Protocol("packet header is not valid".to_string()))
}

impl TheaterClient {
    pub async fn connect(
        host: &str,
        port: u16,
        client_string: impl Into<String>,
        lkey: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let transport = dial_theater(host, port, timeout).await?;
        Ok(TheaterClient {
            transport,
            client_string: client_string.into(),
            lkey: lkey.into(),
            next_tid: 0,
            completed: HashMap::new(),
        })
    }

    fn next_tid(&mut self) -> u32 {
        self.next_tid += 1;
        self.next_tid
    }

    async fn send(&mut self, packet: &TheaterPacket) -> Result<()> {
        self.transport.write_all(&packet.to_bytes()).await
    }

    async fn read_one(&mut self) -> Result<TheaterPacket> {
        let (header, body) = self.transport.read_packet(theater_body_len).await?;
        let packet = TheaterPacket::from_parts(header, body);
        packet.validate_header()?;
        packet.validate_body()?;
        Ok(packet)
    }

    /// Reads one packet, transparently answering `PING` prompts and
    /// dropping any reply whose transaction id belongs to a transaction
    /// the caller has already abandoned. Theater `PING` packets carry no
    /// tid, so they are recognized purely by their header tag.
    async fn wrapped_read(&mut self, tid: u32) -> Result<TheaterPacket> {
        loop {
            let packet = self.read_one().await?;
            if &packet.header[0..4] == b"PING" {
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

    pub async fn connect_handshake(&mut self) -> Result<()> {
        if self.completed.contains_key(&TheaterStep::Conn) {
            return Ok(());
        }
        let tid = self.next_tid();
        let mut payload = Payload::new();
        payload
            .insert("PROT", "2")
            .insert("PROD", self.client_string.clone())
            .insert("VERS", "1.0")
            .insert("PLAT", "PC")
            .insert("LOCALE", "en_US")
            .insert("SDKVERSION", "5.1.2.0.0");

        let packet = TheaterPacket::build(b"CONN", Body::Payload(&payload), TheaterTransmissionType::Request, Some(tid));
        self.send(&packet).await?;
        let response = self.wrapped_read(tid).await?;
        self.completed.insert(TheaterStep::Conn, response);
        Ok(())
    }

    pub async fn authenticate(&mut self) -> Result<()> {
        if self.completed.contains_key(&TheaterStep::User) {
            return Ok(());
        }
        self.connect_handshake().await?;

        let tid = self.next_tid();
        let mut payload = Payload::new();
        payload.insert("LKEY", self.lkey.clone()).insert("NAME", "").insert("MAC", "$000000000000");

        let packet = TheaterPacket::build(b"USER", Body::Payload(&payload), TheaterTransmissionType::Request, Some(tid));
        self.send(&packet).await?;
        let response = self.wrapped_read(tid).await?;

        let parsed = Payload::from_bytes(response.data())?;
        if parsed.get("NAME").is_none() {
            return Err(Error::Auth("Theater rejected the login key".to_string()));
        }

        self.completed.insert(TheaterStep::User, response);
        Ok(())
    }

    pub async fn ping(&mut self) -> Result<()> {
        // Preserved as observed in the original client: the ping reply
        // always carries a literal TID=0, regardless of the connection's
        // actual transaction-id counter.
        let packet = TheaterPacket::build(b"PING", Body::Raw(b"TID=0"), TheaterTransmissionType::OkResponse, None);
        self.send(&packet).await
    }

    // --- Lobby / server enumeration -------------------------------------

    pub async fn get_lobbies(&mut self) -> Result<Vec<Payload>> {
        self.authenticate().await?;
        let tid = self.next_tid();
        let payload = Payload::new();
        let packet = TheaterPacket::build(b"LLST", Body::Payload(&payload), TheaterTransmissionType::Request, Some(tid));
        self.send(&packet).await?;

        let llst = self.wrapped_read(tid).await?;
        check_theater_error(&llst)?;
        let parsed = Payload::from_bytes_typed(llst.data(), &int_parse_map())?;
        let count = parsed.get_int("NUM-LOBBIES", 0) as usize;

        let mut lobbies = Vec::with_capacity(count);
        for _ in 0..count {
            let ldat = self.wrapped_read(tid).await?;
            lobbies.push(Payload::from_bytes(ldat.data())?);
        }
        Ok(lobbies)
    }

    /// `NUM-GAMES` may be smaller than `LOBBY-NUM-GAMES` when the server
    /// applies its own filtering; the client must read exactly the
    /// advertised count, never the lobby total.
    pub async fn get_servers(&mut self, lobby_id: i64) -> Result<Vec<Payload>> {
        self.authenticate().await?;
        let tid = self.next_tid();
        let mut payload = Payload::new();
        payload.insert("LID", lobby_id);
        let packet = TheaterPacket::build(b"GLST", Body::Payload(&payload), TheaterTransmissionType::Request, Some(tid));
        self.send(&packet).await?;

        let glst = self.wrapped_read(tid).await?;
        check_theater_error(&glst)?;
        let parsed = Payload::from_bytes_typed(glst.data(), &int_parse_map())?;
        let count = parsed.get_int("NUM-GAMES", 0) as usize;

        let mut servers = Vec::with_capacity(count);
        for _ in 0..count {
            let gdat = self.wrapped_read(tid).await?;
            servers.push(Payload::from_bytes(gdat.data())?);
        }
        Ok(servers)
    }

    pub async fn get_server_details(&mut self, lobby_id: i64, game_id: i64) -> Result<ServerDetails> {
        self.get_gdat(GdatQuery::LobbyGame { lobby_id, game_id }).await
    }

    pub async fn get_current_server(&mut self, user_id: i64) -> Result<ServerDetails> {
        self.get_gdat(GdatQuery::CurrentServerOf { user_id }).await
    }

    /// Sends one `GDAT` request parameterized by either a lobby/game pair
    /// or a user id, then reads the `GDAT` response, the `GDET` that
    /// follows, and exactly `AP` (active players) `PDAT` packets.
    pub async fn get_gdat(&mut self, query: GdatQuery) -> Result<ServerDetails> {
        self.authenticate().await?;
        let tid = self.next_tid();
        let mut payload = Payload::new();
        match query {
            GdatQuery::LobbyGame { lobby_id, game_id } => {
                payload.insert("LID", lobby_id).insert("GID", game_id);
            }
            GdatQuery::CurrentServerOf { user_id } => {
                payload.insert("UID", user_id);
            }
        }
        let packet = TheaterPacket::build(b"GDAT", Body::Payload(&payload), TheaterTransmissionType::Request, Some(tid));
        self.send(&packet).await?;

        let gdat_packet = self.wrapped_read(tid).await?;
        check_theater_error(&gdat_packet)?;
        let gdat = Payload::from_bytes(gdat_packet.data())?;

        let gdet_packet = self.wrapped_read(tid).await?;
        let gdet = Payload::from_bytes(gdet_packet.data())?;

        let active_players = gdet.get_int("AP", 0) as usize;
        let mut players = Vec::with_capacity(active_players);
        for _ in 0..active_players {
            let pdat = self.wrapped_read(tid).await?;
            players.push(Payload::from_bytes(pdat.data())?);
        }

        debug!("read GDAT/GDET with {} active players", players.len());
        Ok(ServerDetails { gdat, gdet, players })
    }
}

fn int_parse_map() -> ParseMap {
    ParseMap::new()
        .with(ParseKey::Field("NUM-LOBBIES"), FieldType::Int)
        .with(ParseKey::Field("NUM-GAMES"), FieldType::Int)
        .with(ParseKey::Field("LOBBY-NUM-GAMES"), FieldType::Int)
        .with(ParseKey::Fallback, FieldType::Str)
}

/// Maps a Theater error-tag header to the §7 taxonomy. Error-type packets
/// still carry a valid, drainable body, but the caller should see the
/// typed error rather than parse the body as a success.
fn check_theater_error(packet: &TheaterPacket) -> Result<()> {
    match packet.transmission_type()? {
        TheaterTransmissionType::ErrorResponse(tag) => Err(match &tag {
            b"ngam" => Error::NotFound(NotFoundKind::Server),
            b"nrom" => Error::NotFound(NotFoundKind::Lobby),
            b"ntfn" => Error::NotFound(NotFoundKind::Player),
            b"bpar" => Error::Parameter("Theater rejected a request parameter".to_string()),
            _ => Error::Protocol(format!("unrecognized Theater error tag {tag:?}")),
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_theater_error_tags() {
        let mut packet = TheaterPacket::build(b"GDAT", Body::Raw(b"UID=1"), TheaterTransmissionType::Request, Some(1));
        packet.set_transmission_type(TheaterTransmissionType::ErrorResponse(*b"ntfn"));
        assert!(matches!(
            check_theater_error(&packet),
            Err(Error::NotFound(NotFoundKind::Player))
        ));

        packet.set_transmission_type(TheaterTransmissionType::ErrorResponse(*b"ngam"));
        assert!(matches!(
            check_theater_error(&packet),
            Err(Error::NotFound(NotFoundKind::Server))
        ));

        packet.set_transmission_type(TheaterTransmissionType::ErrorResponse(*b"nrom"));
        assert!(matches!(
            check_theater_error(&packet),
            Err(Error::NotFound(NotFoundKind::Lobby))
        ));

        packet.set_transmission_type(TheaterTransmissionType::ErrorResponse(*b"bpar"));
        assert!(matches!(check_theater_error(&packet), Err(Error::Parameter(_))));
    }

    #[test]
    fn ok_response_has_no_error() {
        let packet = TheaterPacket::build(b"GDAT", Body::Raw(b"UID=1"), TheaterTransmissionType::OkResponse, Some(1));
        assert!(check_theater_error(&packet).is_ok());
    }
}
