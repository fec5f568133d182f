//! Control commands (handshake, exit, entry info, unsupported).

use tracing::{info, warn};

use super::{Dispatcher, Reply};
use crate::protocol::constants::{
    CMD_GET_ENTRY_INFO, CMD_HANDSHAKE, PROTOCOL_V0, PROTOCOL_VERSION,
};
use crate::protocol::{Response, Status};

/// HANDSHAKE - settle the protocol version.
///
/// Any version this host speaks is accepted as-is; anything newer is
/// reported back with the host's version rather than coerced.
pub fn handshake(d: &mut Dispatcher, version: u32) -> Reply {
    if !(PROTOCOL_V0..=PROTOCOL_VERSION).contains(&version) {
        warn!(device = version, host = PROTOCOL_VERSION, "Protocol version mismatch");
        return Reply::HandshakeRejected {
            response: Response::failure_with_detail(
                CMD_HANDSHAKE,
                Status::HandshakeFailed,
                PROTOCOL_VERSION,
            ),
            device_version: version,
        };
    }

    info!(version, "Protocol version negotiated");
    d.set_version(version);
    Reply::Negotiated {
        response: Response::handshake(version),
        version,
    }
}

/// ENTRY_INFO - metadata for one catalog entry.
pub fn entry_info(d: &Dispatcher, id: u32) -> Reply {
    let entry = match d.catalog().lookup(id) {
        Ok(entry) => entry,
        Err(e) => {
            warn!(error = %e, "Entry info for unknown entry");
            return Reply::Frame(Response::failure(
                CMD_GET_ENTRY_INFO,
                Status::UnknownIdentifier,
            ));
        }
    };

    let response = Response::entry_info(&entry.info());
    if response.payload.len() > d.page_size() {
        warn!(id, path = %entry.display_path, "Entry info does not fit one frame");
        return Reply::Frame(Response::failure(CMD_GET_ENTRY_INFO, Status::Malformed));
    }
    Reply::Frame(response)
}

/// EXIT - receiver is done.
pub fn exit() -> Reply {
    info!("EXIT: receiver closed the session");
    Reply::Exit(Response::exit())
}

/// Anything else: report and keep serving.
pub fn unsupported(opcode: u32) -> Reply {
    warn!(opcode = %format!("{:#x}", opcode), "Unsupported command");
    Reply::Frame(Response::failure(opcode, Status::UnsupportedCommand))
}
