//! Messages for negotiating padding machines over a circuit.
//!
//! Two messages flow as control cells addressed to the target hop:
//! `PADDING_NEGOTIATE` from the origin, and `PADDING_NEGOTIATED` back
//! from the relay.  The payloads are fixed-layout; the transport
//! zero-pads them to the cell size, and ignores the padding on receipt.

use caret::caret_int;
use tor_bytes::{EncodeResult, Readable, Reader, Result, Writer};

use crate::machine::MachineNum;

/// The negotiation payload version this implementation speaks.
pub const PADDING_NEGOTIATE_VERSION: u8 = 0;

caret_int! {
    /// A command in a padding negotiation message.
    pub struct PadNegotiateCmd(u8) {
        /// Start the named machine.
        START = 1,
        /// Stop the named machine.
        STOP = 2,
    }
}

caret_int! {
    /// The wire tag describing what kind of machine is being negotiated.
    pub struct PadMachineKind(u8) {
        /// A client-side machine covering circuit setup.
        CIRC_SETUP_CLIENT = 0,
        /// A relay-side machine.
        RELAY = 1,
    }
}

caret_int! {
    /// A relay's response code in a `PADDING_NEGOTIATED` message.
    pub struct PadResponse(u8) {
        /// The machine was installed (or stopped) as requested.
        SUCCESS = 0,
        /// The relay does not know the named machine.
        ERR_UNKNOWN_MACHINE = 1,
        /// The relay does not speak this negotiation version.
        ERR_UNSUPPORTED_VERSION = 2,
        /// The machine's conditions do not hold on the relay side.
        ERR_NOT_APPLICABLE = 3,
        /// The relay failed to install the machine.
        ERR_INTERNAL = 4,
    }
}

/// A `PADDING_NEGOTIATE` message: origin to relay.
///
/// Asks the target hop to start or stop a padding machine.  The origin
/// may begin padding immediately after sending `START`, without waiting
/// for the response.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PaddingNegotiate {
    /// Protocol version of this payload.
    ///
    /// Kept as received so that a relay can echo it back when rejecting
    /// an unsupported version.
    version: u8,
    /// Whether to start or stop the machine.
    command: PadNegotiateCmd,
    /// The kind tag of the machine.
    machine_kind: PadMachineKind,
    /// Which machine specification is meant.
    machine_number: MachineNum,
    /// Sequence number matching responses to requests across rapid
    /// replacement.  Little-endian on the wire.
    machine_ctr: u32,
}

impl PaddingNegotiate {
    /// Construct a `START` request for the given machine.
    pub fn start(machine_kind: PadMachineKind, machine_number: MachineNum, machine_ctr: u32) -> Self {
        PaddingNegotiate {
            version: PADDING_NEGOTIATE_VERSION,
            command: PadNegotiateCmd::START,
            machine_kind,
            machine_number,
            machine_ctr,
        }
    }

    /// Construct a `STOP` request for the given machine.
    pub fn stop(machine_kind: PadMachineKind, machine_number: MachineNum, machine_ctr: u32) -> Self {
        PaddingNegotiate {
            version: PADDING_NEGOTIATE_VERSION,
            command: PadNegotiateCmd::STOP,
            machine_kind,
            machine_number,
            machine_ctr,
        }
    }

    /// The payload version the sender used.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// The requested command.
    pub fn command(&self) -> PadNegotiateCmd {
        self.command
    }

    /// The machine kind tag.
    pub fn machine_kind(&self) -> PadMachineKind {
        self.machine_kind
    }

    /// The machine this request names.
    pub fn machine_number(&self) -> MachineNum {
        self.machine_number
    }

    /// The request's sequence number.
    pub fn machine_ctr(&self) -> u32 {
        self.machine_ctr
    }

    /// Encode this message's body onto a writer.
    pub fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_u8(self.version);
        w.write_u8(self.command.into());
        w.write_u8(self.machine_kind.into());
        w.write_u8(self.machine_number.into());
        w.write_all(&self.machine_ctr.to_le_bytes());
        Ok(())
    }

    /// Decode a message body from a reader.
    pub fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        r.extract()
    }

    /// Decode a message body from a raw cell payload.
    ///
    /// Trailing zero padding (up to the transport cell size) is
    /// ignored.
    pub fn decode(payload: &[u8]) -> crate::Result<Self> {
        let mut r = Reader::from_slice(payload);
        r.extract().map_err(|err| crate::Error::BytesErr {
            err,
            parsed: "PADDING_NEGOTIATE message",
        })
    }
}

impl Readable for PaddingNegotiate {
    fn take_from(r: &mut Reader<'_>) -> Result<Self> {
        let version = r.take_u8()?;
        let command = r.take_u8()?.into();
        let machine_kind = r.take_u8()?.into();
        let machine_number = r.take_u8()?.into();
        let machine_ctr = take_u32_le(r)?;
        Ok(PaddingNegotiate {
            version,
            command,
            machine_kind,
            machine_number,
            machine_ctr,
        })
    }
}

/// A `PADDING_NEGOTIATED` message: relay to origin.
///
/// Mirrors the fields of the request it answers, plus a response code.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PaddingNegotiated {
    /// Protocol version of this payload.
    version: u8,
    /// The command this message answers.
    command: PadNegotiateCmd,
    /// The kind tag of the machine.
    machine_kind: PadMachineKind,
    /// Which machine specification is meant.
    machine_number: MachineNum,
    /// The sequence number of the request being answered.
    machine_ctr: u32,
    /// Whether the request succeeded, and if not, why.
    response: PadResponse,
}

impl PaddingNegotiated {
    /// Construct a reply to `req` with the given response code.
    pub fn reply_to(req: &PaddingNegotiate, response: PadResponse) -> Self {
        PaddingNegotiated {
            version: PADDING_NEGOTIATE_VERSION,
            command: req.command(),
            machine_kind: req.machine_kind(),
            machine_number: req.machine_number(),
            machine_ctr: req.machine_ctr(),
            response,
        }
    }

    /// The payload version the sender used.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// The command this message answers.
    pub fn command(&self) -> PadNegotiateCmd {
        self.command
    }

    /// The machine kind tag.
    pub fn machine_kind(&self) -> PadMachineKind {
        self.machine_kind
    }

    /// The machine this response names.
    pub fn machine_number(&self) -> MachineNum {
        self.machine_number
    }

    /// The sequence number of the request being answered.
    pub fn machine_ctr(&self) -> u32 {
        self.machine_ctr
    }

    /// The response code.
    pub fn response(&self) -> PadResponse {
        self.response
    }

    /// Encode this message's body onto a writer.
    pub fn encode_onto<W: Writer + ?Sized>(self, w: &mut W) -> EncodeResult<()> {
        w.write_u8(self.version);
        w.write_u8(self.command.into());
        w.write_u8(self.machine_kind.into());
        w.write_u8(self.machine_number.into());
        w.write_all(&self.machine_ctr.to_le_bytes());
        w.write_u8(self.response.into());
        Ok(())
    }

    /// Decode a message body from a reader.
    pub fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        r.extract()
    }

    /// Decode a message body from a raw cell payload.
    ///
    /// Trailing zero padding (up to the transport cell size) is
    /// ignored.
    pub fn decode(payload: &[u8]) -> crate::Result<Self> {
        let mut r = Reader::from_slice(payload);
        r.extract().map_err(|err| crate::Error::BytesErr {
            err,
            parsed: "PADDING_NEGOTIATED message",
        })
    }
}

impl Readable for PaddingNegotiated {
    fn take_from(r: &mut Reader<'_>) -> Result<Self> {
        let version = r.take_u8()?;
        let command = r.take_u8()?.into();
        let machine_kind = r.take_u8()?.into();
        let machine_number = r.take_u8()?.into();
        let machine_ctr = take_u32_le(r)?;
        let response = r.take_u8()?.into();
        Ok(PaddingNegotiated {
            version,
            command,
            machine_kind,
            machine_number,
            machine_ctr,
            response,
        })
    }
}

/// Take a little-endian u32 from a reader.
///
/// (`machine_ctr` is the one multi-byte field in these payloads, and it
/// is little-endian, unlike the rest of the Tor wire protocol.)
fn take_u32_le(r: &mut Reader<'_>) -> Result<u32> {
    let b = [r.take_u8()?, r.take_u8()?, r.take_u8()?, r.take_u8()?];
    Ok(u32::from_le_bytes(b))
}
