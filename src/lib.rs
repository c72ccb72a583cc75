//! Client library for the FESL (account/stats/leaderboard) and Theater
//! (lobby/server discovery) backends used by Battlefield: Bad Company,
//! Bad Company 2, and Battlefield 1943.
//!
//! A typical session authenticates against FESL, obtains a login key
//! (`lkey`), and then optionally cross-authenticates to Theater with that
//! key to enumerate lobbies and servers:
//!
//! ```no_run
//! use bfbc2_fesl::constants::{backend_for, Namespace, Platform};
//! use bfbc2_fesl::fesl::FeslClient;
//! use bfbc2_fesl::theater::TheaterClient;
//! use std::time::Duration;
//!
//! # async fn run() -> bfbc2_fesl::error::Result<()> {
//! let backend = backend_for(Platform::Pc);
//! let mut fesl = FeslClient::connect(
//!     backend.host,
//!     backend.port,
//!     Platform::Pc,
//!     backend.client_string,
//!     "player",
//!     "hunter2",
//!     true,
//!     Duration::from_secs(10),
//! )
//! .await?;
//! let lkey = fesl.get_lkey().await?;
//! let (theater_host, theater_port) = fesl.get_theater_details().await?;
//!
//! let mut theater = TheaterClient::connect(
//!     &theater_host,
//!     theater_port,
//!     backend.client_string,
//!     lkey,
//!     Duration::from_secs(10),
//! )
//! .await?;
//! let lobbies = theater.get_lobbies().await?;
//! let _ = lobbies;
//! let _ = Namespace::Battlefield;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod constants;
pub mod dogtag;
pub mod error;
pub mod fesl;
pub mod packet;
pub mod payload;
pub mod theater;
pub mod transport;

pub use error::{Error, Result};
