//! Command protocol spoken between clients, execution servers and relays.
//!
//! A session is a strict request/acknowledge exchange over one duplex byte
//! stream. Every token is a length-prefixed frame (see [`MessageStream`]).
//!
//! ```text
//! VERSION  -> ACK, major:i32, minor:i32, FIN
//! RUN      -> ACK, { path -> ACK, tag:i32 -> ACK, value -> ACK }*, FIN -> ACK
//!             ... execution ... FIN | error text
//! READ     -> ACK, table -> ACK, { column -> ACK }*, FIN -> ACK
//!             ... execution ... FIN | error text
//!             after the client ACKs FIN, per column:
//!             type name -> ACK, packed values -> ACK
//! ```
//!
//! Any other token is acknowledged and ignored.

pub mod client;
pub mod codec;
pub mod command;
pub mod server;
pub mod table;

pub use client::{ClientProtocol, CommandReply};
pub use codec::{MessageStream, MAX_FRAME_LEN};
pub use command::{Command, CommandOutput, MatchPolicy, Override, ParamType, ParamValue};
pub use server::ServerProtocol;
pub use table::{Column, ColumnValues, DataTable};

pub const RUN: &str = "RUN";
pub const READ: &str = "READ";
pub const VERSION: &str = "VERSION";
pub const ACK: &str = "ACK";
pub const FIN: &str = "FIN";

pub const PROTOCOL_VERSION_MAJOR: i32 = 1;
pub const PROTOCOL_VERSION_MINOR: i32 = 0;
