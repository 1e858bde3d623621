//! OPTNEG handshake: the wire struct both peers exchange, the two
//! negotiation-outcome computations (server accepting an MTA's request,
//! client validating a server's response) and the macro-subscription
//! trailer that rides along with a server's OPTNEG reply. No teacher
//! equivalent — `rmilter` never negotiates, it assumes a fixed protocol —
//! grounded on `miltr_common::optneg::OptNeg::merge_compatible` for the
//! shape of a negotiation outcome, adapted to the intersection rule this
//! protocol actually specifies.

use crate::error::{NegotiationError, WireError};
use crate::options::{
    actions_supported_at, protocol_supported_at, ActionMask, MacroStage, MaxDataSize,
    ProtocolMask, MAX_VERSION, MIN_VERSION,
};
use crate::macro_store::MacroSubscriptions;
use crate::wire::{read_cstr, write_cstr};

/// The 12-byte fixed body of an OPTNEG frame: version, action bits,
/// protocol bits, all big-endian u32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptNeg {
    pub version: u32,
    pub actions: ActionMask,
    pub protocol: ProtocolMask,
}

impl OptNeg {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12);
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.extend_from_slice(&self.actions.bits().to_be_bytes());
        buf.extend_from_slice(&self.protocol.bits().to_be_bytes());
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        if payload.len() < 12 {
            return Err(WireError::Truncated);
        }
        let version = u32::from_be_bytes(payload[0..4].try_into().unwrap());
        let actions = ActionMask::from_bits_truncate(u32::from_be_bytes(payload[4..8].try_into().unwrap()));
        let protocol = ProtocolMask::from_bits_truncate(u32::from_be_bytes(payload[8..12].try_into().unwrap()));
        Ok(Self { version, actions, protocol })
    }
}

/// The fully resolved outcome of a handshake: what both sides actually
/// agreed to use, not just what either side asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub version: u32,
    pub actions: ActionMask,
    pub protocol: ProtocolMask,
    pub max_data: MaxDataSize,
}

/// Computes what a server should reply given the MTA's OPTNEG request and
/// the filter's own wanted action/protocol bits. The server's "used" data
/// size is always derived from the MTA's own advertised bits, not the
/// filter's — the MTA alone decides how big a single frame it will send.
pub fn server_negotiate_default(
    mta: &OptNeg,
    filter_actions: ActionMask,
    filter_protocol: ProtocolMask,
    local_max_version: u32,
) -> Result<Negotiated, NegotiationError> {
    let max_version = local_max_version.min(MAX_VERSION);
    if mta.version < MIN_VERSION || mta.version > max_version {
        return Err(NegotiationError::VersionOutOfRange {
            requested: mta.version,
            max: max_version,
        });
    }
    let version = mta.version;

    let clipped_actions = filter_actions & actions_supported_at(version);
    let clipped_protocol = filter_protocol & protocol_supported_at(version);

    if !mta.actions.contains(clipped_actions) {
        return Err(NegotiationError::ActionsNotOffered {
            requested: clipped_actions,
            offered: mta.actions,
        });
    }

    let mds_bits = ProtocolMask::MDS_256K | ProtocolMask::MDS_1M;
    let mta_protocol_sans_mds = mta.protocol - mds_bits;
    if !mta_protocol_sans_mds.contains(clipped_protocol - mds_bits) {
        return Err(NegotiationError::ProtocolNotOffered {
            requested: clipped_protocol,
            offered: mta.protocol,
        });
    }

    Ok(Negotiated {
        version,
        actions: clipped_actions,
        protocol: clipped_protocol,
        max_data: MaxDataSize::from_protocol_bits(mta.protocol),
    })
}

/// Validates a server's OPTNEG response against what the client asked
/// for. The client's "used" data size is always whatever it itself
/// configured and advertised, never something the server can override.
pub fn client_validate_response(requested: &OptNeg, response: &OptNeg) -> Result<Negotiated, NegotiationError> {
    if response.version < MIN_VERSION || response.version > requested.version {
        return Err(NegotiationError::VersionOutOfRange {
            requested: response.version,
            max: requested.version,
        });
    }
    let version = response.version;

    if !requested.actions.contains(response.actions) {
        return Err(NegotiationError::ActionsNotOffered {
            requested: response.actions,
            offered: requested.actions,
        });
    }

    let mds_bits = ProtocolMask::MDS_256K | ProtocolMask::MDS_1M;
    if !requested.protocol.contains(response.protocol - mds_bits) {
        return Err(NegotiationError::ProtocolNotOffered {
            requested: response.protocol,
            offered: requested.protocol,
        });
    }

    let mut protocol = response.protocol;
    if version <= 3 {
        protocol.insert(ProtocolMask::NO_UNKNOWN);
    }
    if version <= 4 {
        protocol.insert(ProtocolMask::NO_DATA);
    }

    Ok(Negotiated {
        version,
        actions: response.actions,
        protocol,
        max_data: MaxDataSize::from_protocol_bits(requested.protocol),
    })
}

/// Parses the macro-subscription trailer a server may append after the
/// fixed 12-byte OPTNEG body. Each entry is a 4-byte big-endian stage
/// index followed by a NUL-terminated, space-separated list of names.
/// Unknown stage indices and duplicate stages are logged and tolerated
/// rather than treated as fatal, since they don't affect wire framing.
pub fn parse_subscriptions(mut rest: &[u8]) -> MacroSubscriptions {
    let mut subs = MacroSubscriptions::default();
    while rest.len() >= 4 {
        let index = u32::from_be_bytes(rest[0..4].try_into().unwrap());
        rest = &rest[4..];
        let names = match read_cstr(rest) {
            Ok((names, remainder)) => {
                rest = remainder;
                names
            }
            Err(_) => {
                log::warn!("OPTNEG subscription trailer missing terminating NUL, stopping early");
                break;
            }
        };
        match MacroStage::from_subscription_index(index) {
            Some(stage) => {
                let list: Vec<String> = names.split_whitespace().map(String::from).collect();
                subs.set(stage, list);
            }
            None => log::warn!("ignoring macro subscription for unknown stage index {index}"),
        }
    }
    subs
}

pub fn encode_subscriptions(subs: &MacroSubscriptions) -> Vec<u8> {
    let mut buf = Vec::new();
    for stage in MacroStage::ALL {
        let Some(index) = stage.subscription_index() else {
            continue;
        };
        let names = subs.get(stage);
        if names.is_empty() {
            continue;
        }
        buf.extend_from_slice(&index.to_be_bytes());
        write_cstr(&mut buf, &names.join(" "));
    }
    buf
}
