//! Wire protocol for the bridgemux fabric: frame codec, commands and the
//! bridge/event data model shared by server and agent.

pub mod codec;
pub mod model;

pub use codec::{
    read_ack, read_frame, read_json, write_ack, write_frame, write_json, CodecError, Command,
    HEADER_LEN, MAGIC, MAX_PAYLOAD,
};
pub use model::{
    Bridge, Direction, Event, EventName, Family, ProxyRequest, RevProxyListenRequest, RevProxyWork,
};
