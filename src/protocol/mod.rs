//! Wire Protocol Module
//!
//! Encoding and decoding of the binary command protocol and the text info
//! protocol. Nothing in here touches a socket.
//!
//! ## Frame Types
//!
//! | Type | Name       | Body                                     |
//! |------|------------|------------------------------------------|
//! | 1    | INFO       | newline separated names / name-value text |
//! | 2    | ADMIN      | login and session messages               |
//! | 3    | MESSAGE    | command header, fields, operations       |
//! | 4    | COMPRESSED | original size + zlib of a full frame     |

pub mod command;
pub mod compression;
pub mod header;
pub mod info;
pub mod response;

pub use command::{OpKind, Operation};
pub use header::{msg_type, MessageHeader, ProtoHeader, MSG_HEADER_SIZE, PROTO_SIZE};
pub use info::InfoResponse;
pub use response::{BatchParser, RecordParser, ResponseParser};
