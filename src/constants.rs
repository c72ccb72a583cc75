//! Static configuration data: backend addresses, namespaces, and the wire
//! constants shared by every operation. None of this is parsed from a file;
//! it mirrors the small, hand-written tables the original client carried
//! alongside its protocol code.

/// Maximum size, in bytes, of a single request/response fragment before the
/// stats-query protocol switches to chunked multi-packet transmission.
pub const FRAGMENT_SIZE: usize = 8096;

/// Length of every FESL/Theater packet header.
pub const HEADER_LENGTH: usize = 12;

/// Epoch dogtag timestamps are measured from (days since this instant).
pub const DOGTAG_EPOCH_YEAR: i32 = 2008;
pub const DOGTAG_EPOCH_MONTH: u32 = 1;
pub const DOGTAG_EPOCH_DAY: u32 = 1;

/// The platform an account belongs to, used to pick a backend and a default
/// namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Pc,
    Ps3,
    Xbox360,
}

/// Logical account realm. Affects which FESL lookup/search operation name
/// is used (see [`Namespace::is_legacy`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Battlefield,
    Xbox,
    Ps3,
    CemEaId,
    /// Legacy Xbox 360 namespace, predates `cem_ea_id`.
    XblSub,
    /// Legacy PS3 namespace, predates `cem_ea_id`.
    Ps3Sub,
}

impl Namespace {
    pub fn as_bytes(&self) -> &'static [u8] {
        self.as_str().as_bytes()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Battlefield => "battlefield",
            Namespace::Xbox => "xbox",
            Namespace::Ps3 => "ps3",
            Namespace::CemEaId => "cem_ea_id",
            Namespace::XblSub => "XBL_SUB",
            Namespace::Ps3Sub => "PS3_SUB",
        }
    }

    /// Legacy namespaces select `LookupUserInfo`/`SearchOwners` instead of
    /// the `Nu`-prefixed modern operations.
    pub fn is_legacy(&self) -> bool {
        matches!(self, Namespace::XblSub | Namespace::Ps3Sub)
    }
}

/// A backend host/port/client-string triple.
#[derive(Debug, Clone, Copy)]
pub struct Backend {
    pub host: &'static str,
    pub port: u16,
    pub client_string: &'static str,
}

pub const BFBC2_PC: Backend = Backend {
    host: "bfbc2-pc-server.fesl.ea.com",
    port: 18321,
    client_string: "bfbc2-pc",
};

pub const BFBC2_PS3: Backend = Backend {
    host: "bfbc2-ps3.fesl.ea.com",
    port: 18321,
    client_string: "bfbc2-ps3",
};

pub const BFBC2_XBOX360: Backend = Backend {
    host: "bfbc2-360.fesl.ea.com",
    port: 18321,
    client_string: "bfbc2-360",
};

/// Default leaderboard stat keys used when the caller does not supply its
/// own list.
pub const DEFAULT_LEADERBOARD_KEYS: &[&str] = &["deaths", "kills", "score", "time"];

pub const fn backend_for(platform: Platform) -> Backend {
    match platform {
        Platform::Pc => BFBC2_PC,
        Platform::Ps3 => BFBC2_PS3,
        Platform::Xbox360 => BFBC2_XBOX360,
    }
}
