//! The negotiable data model: action/protocol bitmasks, the max-data-size
//! tiers and the macro stage enumeration. Bit values match the real
//! sendmail/postfix milter wire protocol so this crate interoperates with
//! any existing peer, not just itself.

use bitflags::bitflags;

bitflags! {
    /// Modifications a filter is allowed to make at end-of-message.
    /// Matches libmilter's `SMFIF_*` bits.
    #[derive(Default)]
    pub struct ActionMask: u32 {
        const ADD_HEADER         = 0x0000_0001;
        const CHANGE_BODY        = 0x0000_0002;
        const ADD_RCPT           = 0x0000_0004;
        const REMOVE_RCPT        = 0x0000_0008;
        const CHANGE_HEADER      = 0x0000_0010;
        const QUARANTINE         = 0x0000_0020;
        const CHANGE_FROM        = 0x0000_0040;
        const ADD_RCPT_WITH_ARGS = 0x0000_0080;
        const SET_MACROS         = 0x0000_0100;
    }
}

bitflags! {
    /// Which commands/replies the MTA and filter each want suppressed, plus
    /// the max-data-size advertisement. Matches libmilter's `SMFIP_*` bits.
    #[derive(Default)]
    pub struct ProtocolMask: u32 {
        const NO_CONNECT          = 0x0000_0001;
        const NO_HELO             = 0x0000_0002;
        const NO_MAIL             = 0x0000_0004;
        const NO_RECIPIENT        = 0x0000_0008;
        const NO_BODY             = 0x0000_0010;
        const NO_HEADER           = 0x0000_0020;
        const NO_END_OF_HEADER    = 0x0000_0040;
        /// Not named in the distilled bit list, but required for the
        /// general "suppress reply if the matching No*Reply bit is set"
        /// rule to hold for HEADER too. See DESIGN.md.
        const NO_HEADER_REPLY     = 0x0000_0080;
        const NO_UNKNOWN          = 0x0000_0100;
        const NO_DATA             = 0x0000_0200;
        const SKIP                = 0x0000_0400;
        const RCPT_REJECT         = 0x0000_0800;
        const NR_CONNECT          = 0x0000_1000;
        const NR_HELO             = 0x0000_2000;
        const NR_MAIL             = 0x0000_4000;
        const NR_RECIPIENT        = 0x0000_8000;
        const NR_DATA             = 0x0001_0000;
        const NR_UNKNOWN          = 0x0002_0000;
        const NR_END_OF_HEADER    = 0x0004_0000;
        const NR_BODY             = 0x0008_0000;
        const HEADER_LEADING_SPACE = 0x0010_0000;
        const MDS_256K            = 0x1000_0000;
        const MDS_1M              = 0x2000_0000;
    }
}

pub const MIN_VERSION: u32 = 2;
pub const MAX_VERSION: u32 = 6;

/// Action bits usable at a given negotiated version. `ChangeFrom` and
/// `AddRcptWithArgs` are v6-only.
pub fn actions_supported_at(version: u32) -> ActionMask {
    let mut mask = ActionMask::all();
    if version < 6 {
        mask.remove(ActionMask::CHANGE_FROM | ActionMask::ADD_RCPT_WITH_ARGS);
    }
    mask
}

/// Protocol bits usable at a given negotiated version. `UNKNOWN` needs
/// v>=3, `DATA` needs v>=4, and every No*Reply suppression bit needs v6.
pub fn protocol_supported_at(version: u32) -> ProtocolMask {
    let mut mask = ProtocolMask::all();
    if version < 3 {
        mask.remove(ProtocolMask::NO_UNKNOWN);
    }
    if version < 4 {
        mask.remove(ProtocolMask::NO_DATA);
    }
    if version < 6 {
        mask.remove(
            ProtocolMask::NR_CONNECT
                | ProtocolMask::NR_HELO
                | ProtocolMask::NR_MAIL
                | ProtocolMask::NR_RECIPIENT
                | ProtocolMask::NR_DATA
                | ProtocolMask::NR_UNKNOWN
                | ProtocolMask::NR_END_OF_HEADER
                | ProtocolMask::NO_HEADER_REPLY
                | ProtocolMask::NR_BODY,
        );
    }
    mask
}

/// The per-side emission cap negotiated via the `MDS_*` protocol bits.
/// Two distinct sizes flow over the wire: what the MTA *offers* (these
/// bits as sent in its OPTNEG request) and what each side actually
/// *uses* as its own emission cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxDataSize {
    Size64K,
    Size256K,
    Size1M,
}

impl MaxDataSize {
    pub const fn bytes(self) -> usize {
        match self {
            MaxDataSize::Size64K => 65_536,
            MaxDataSize::Size256K => 262_144,
            MaxDataSize::Size1M => 1_048_576,
        }
    }

    pub fn from_protocol_bits(bits: ProtocolMask) -> Self {
        if bits.contains(ProtocolMask::MDS_1M) {
            MaxDataSize::Size1M
        } else if bits.contains(ProtocolMask::MDS_256K) {
            MaxDataSize::Size256K
        } else {
            MaxDataSize::Size64K
        }
    }

    pub fn protocol_bit(self) -> ProtocolMask {
        match self {
            MaxDataSize::Size64K => ProtocolMask::empty(),
            MaxDataSize::Size256K => ProtocolMask::MDS_256K,
            MaxDataSize::Size1M => ProtocolMask::MDS_1M,
        }
    }
}

impl Default for MaxDataSize {
    fn default() -> Self {
        MaxDataSize::Size64K
    }
}

/// The stages a macro definition can be scoped to. Ordinal order matters:
/// `MacroStore::get` scans from `EndMarker` down to `Connect`, and the
/// server's per-command cleanup clears "this stage and above" by ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(usize)]
pub enum MacroStage {
    Connect = 0,
    Helo = 1,
    Mail = 2,
    Rcpt = 3,
    Data = 4,
    EndOfMessage = 5,
    EndOfHeaders = 6,
    /// Ephemeral, per-command scratch stage for HEADER/BODY/UNKNOWN, which
    /// have no persistent stage of their own. Cleared after each command
    /// whose response has been sent.
    EndMarker = 7,
}

impl MacroStage {
    pub const COUNT: usize = 8;

    pub const ALL: [MacroStage; Self::COUNT] = [
        MacroStage::Connect,
        MacroStage::Helo,
        MacroStage::Mail,
        MacroStage::Rcpt,
        MacroStage::Data,
        MacroStage::EndOfMessage,
        MacroStage::EndOfHeaders,
        MacroStage::EndMarker,
    ];

    /// The subset of stages an MTA may advertise subscriptions for.
    /// `EndMarker` is never subscribable — it's cleared too eagerly.
    pub fn from_subscription_index(index: u32) -> Option<MacroStage> {
        match index {
            0 => Some(MacroStage::Connect),
            1 => Some(MacroStage::Helo),
            2 => Some(MacroStage::Mail),
            3 => Some(MacroStage::Rcpt),
            4 => Some(MacroStage::Data),
            5 => Some(MacroStage::EndOfMessage),
            6 => Some(MacroStage::EndOfHeaders),
            _ => None,
        }
    }

    pub fn subscription_index(self) -> Option<u32> {
        match self {
            MacroStage::Connect => Some(0),
            MacroStage::Helo => Some(1),
            MacroStage::Mail => Some(2),
            MacroStage::Rcpt => Some(3),
            MacroStage::Data => Some(4),
            MacroStage::EndOfMessage => Some(5),
            MacroStage::EndOfHeaders => Some(6),
            MacroStage::EndMarker => None,
        }
    }
}
