//! Contracts between the routing core and its external collaborators:
//! wire-protocol codecs and router policies.
//!
//! The core is protocol-agnostic. A codec hands it framed, classified
//! packets; a router turns classifications into route plans; the core
//! splices packets between descriptors without interpreting them.

pub mod contract;
pub mod packet;
pub mod parse;
pub mod plan;

pub use contract::{
    AuthProgress, BackendCodec, ClientCodec, ProtocolModule, ReuseScore, RouterModule,
    RouterPolicy, SessionProfile,
};
pub use packet::{Classification, Packet, StatementKind};
pub use parse::{ParseInfo, SharedParse, SqlDialect, VersionTag};
pub use plan::{Recovery, ReplyShape, ReplyStep, RoutePlan};
