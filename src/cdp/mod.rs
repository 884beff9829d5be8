mod error;
mod types;

pub use error::CdpError;
pub use types::{
    parse_bridge_message, BridgeCommand, BridgeEvent, BridgeLog, BridgeMessage, CdpCommand,
    CdpEvent, CdpResponse, RawCdpMessage,
};
