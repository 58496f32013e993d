use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};
use bytes::BufMut;

use crate::bits::test_bit;
use crate::error::DecodeError;

/// OpenFlow 1.0 protocol version as carried in headers.
pub const OFP_VERSION: u8 = 0x01;

/// OpenFlow 1.0 message type codes, used by headers to identify meaning of the rest of a message.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MsgCode {
    Hello,
    Error,
    EchoReq,
    EchoResp,
    Vendor,
    FeaturesReq,
    FeaturesResp,
    GetConfigReq,
    GetConfigResp,
    SetConfig,
    PacketIn,
    FlowRemoved,
    PortStatus,
    PacketOut,
    FlowMod,
    PortMod,
    StatsReq,
    StatsResp,
    BarrierReq,
    BarrierResp,
    QueueGetConfigReq,
    QueueGetConfigResp,
}

impl TryFrom<u8> for MsgCode {
    type Error = DecodeError;

    fn try_from(code: u8) -> Result<MsgCode, DecodeError> {
        const CODES: [MsgCode; 22] = [
            MsgCode::Hello,
            MsgCode::Error,
            MsgCode::EchoReq,
            MsgCode::EchoResp,
            MsgCode::Vendor,
            MsgCode::FeaturesReq,
            MsgCode::FeaturesResp,
            MsgCode::GetConfigReq,
            MsgCode::GetConfigResp,
            MsgCode::SetConfig,
            MsgCode::PacketIn,
            MsgCode::FlowRemoved,
            MsgCode::PortStatus,
            MsgCode::PacketOut,
            MsgCode::FlowMod,
            MsgCode::PortMod,
            MsgCode::StatsReq,
            MsgCode::StatsResp,
            MsgCode::BarrierReq,
            MsgCode::BarrierResp,
            MsgCode::QueueGetConfigReq,
            MsgCode::QueueGetConfigResp,
        ];
        CODES
            .get(code as usize)
            .copied()
            .ok_or_else(|| DecodeError::invalid("message type", format!("unknown code {}", code)))
    }
}

/// Common API for message types implementing OpenFlow Message Codes (see `MsgCode` enum).
pub trait MessageType: Sized {
    /// Return the byte-size of a message body.
    fn size_of(&self) -> usize;
    /// Parse a message body.
    fn parse(buf: &[u8]) -> Result<Self, DecodeError>;
    /// Marshal a message body into a `u8` buffer.
    fn marshal(&self, bytes: &mut Vec<u8>);
}

/// Fail unless `buf` holds at least `needed` bytes.
fn ensure_len(what: &'static str, buf: &[u8], needed: usize) -> Result<(), DecodeError> {
    if buf.len() < needed {
        return Err(DecodeError::Truncated {
            what,
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

fn skip(bytes: &mut Cursor<&[u8]>, n: u64) {
    bytes.set_position(bytes.position() + n);
}

fn remaining<'a>(bytes: &Cursor<&'a [u8]>) -> &'a [u8] {
    let buf: &'a [u8] = *bytes.get_ref();
    let position = (bytes.position() as usize).min(buf.len());
    &buf[position..]
}

const OFP_MATCH_SIZE: usize = 40;

/// Every match field wildcarded.
const OFPFW_ALL: u32 = (1 << 22) - 1;

/// Fields to match against flows.
///
/// Only the match-everything pattern is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pattern {}

impl Pattern {
    pub fn match_all() -> Pattern {
        Pattern {}
    }

    fn marshal(&self, bytes: &mut Vec<u8>) {
        bytes.put_u32(OFPFW_ALL);
        bytes.put_bytes(0, OFP_MATCH_SIZE - 4);
    }
}

/// Port behavior.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PseudoPort {
    PhysicalPort(u16),
    InPort,
    Table,
    Normal,
    Flood,
    AllPorts,
    /// Send to the controller, with at most this many bytes of the packet.
    Controller(u16),
    Local,
}

#[repr(u16)]
enum OfpPort {
    OFPPMax = 0xff00,
    OFPPInPort = 0xfff8,
    OFPPTable = 0xfff9,
    OFPPNormal = 0xfffa,
    OFPPFlood = 0xfffb,
    OFPPAll = 0xfffc,
    OFPPController = 0xfffd,
    OFPPLocal = 0xfffe,
    OFPPNone = 0xffff,
}

impl PseudoPort {
    fn of_int(p: u16) -> Result<Option<PseudoPort>, DecodeError> {
        if (OfpPort::OFPPNone as u16) == p {
            Ok(None)
        } else {
            PseudoPort::make(p, 0).map(Some)
        }
    }

    fn make(p: u16, len: u16) -> Result<PseudoPort, DecodeError> {
        let port = match p {
            p if p == (OfpPort::OFPPInPort as u16) => PseudoPort::InPort,
            p if p == (OfpPort::OFPPTable as u16) => PseudoPort::Table,
            p if p == (OfpPort::OFPPNormal as u16) => PseudoPort::Normal,
            p if p == (OfpPort::OFPPFlood as u16) => PseudoPort::Flood,
            p if p == (OfpPort::OFPPAll as u16) => PseudoPort::AllPorts,
            p if p == (OfpPort::OFPPController as u16) => PseudoPort::Controller(len),
            p if p == (OfpPort::OFPPLocal as u16) => PseudoPort::Local,
            p if p <= (OfpPort::OFPPMax as u16) => PseudoPort::PhysicalPort(p),
            p => {
                return Err(DecodeError::invalid(
                    "port",
                    format!("unsupported port number {:#06x}", p),
                ))
            }
        };
        Ok(port)
    }

    fn to_int(&self) -> u16 {
        match *self {
            PseudoPort::PhysicalPort(p) => p,
            PseudoPort::InPort => OfpPort::OFPPInPort as u16,
            PseudoPort::Table => OfpPort::OFPPTable as u16,
            PseudoPort::Normal => OfpPort::OFPPNormal as u16,
            PseudoPort::Flood => OfpPort::OFPPFlood as u16,
            PseudoPort::AllPorts => OfpPort::OFPPAll as u16,
            PseudoPort::Controller(_) => OfpPort::OFPPController as u16,
            PseudoPort::Local => OfpPort::OFPPLocal as u16,
        }
    }

    fn marshal(&self, bytes: &mut Vec<u8>) {
        bytes.put_u16(self.to_int());
    }
}

/// Actions associated with flows and packets.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Action {
    Output(PseudoPort),
}

const OFP_ACTION_OUTPUT_SIZE: usize = 8;

#[repr(u16)]
enum OfpActionType {
    OFPATOutput,
}

impl Action {
    fn type_code(&self) -> OfpActionType {
        match *self {
            Action::Output(_) => OfpActionType::OFPATOutput,
        }
    }

    fn size_of(&self) -> usize {
        match *self {
            Action::Output(_) => OFP_ACTION_OUTPUT_SIZE,
        }
    }

    fn size_of_sequence(actions: &[Action]) -> usize {
        actions.iter().map(Action::size_of).sum()
    }

    /// Parse a packed action list. Action types other than output are skipped.
    fn parse_sequence(buf: &[u8]) -> Result<Vec<Action>, DecodeError> {
        let mut actions = vec![];
        let mut rest = buf;
        while !rest.is_empty() {
            ensure_len("action header", rest, 4)?;
            let mut bytes = Cursor::new(rest);
            let action_code = bytes.read_u16::<BigEndian>()?;
            let len = bytes.read_u16::<BigEndian>()? as usize;
            if len < 4 || len % 8 != 0 || len > rest.len() {
                return Err(DecodeError::invalid(
                    "action",
                    format!("length {} with {} bytes remaining", len, rest.len()),
                ));
            }
            if action_code == OfpActionType::OFPATOutput as u16 {
                ensure_len("output action", rest, OFP_ACTION_OUTPUT_SIZE)?;
                let port_code = bytes.read_u16::<BigEndian>()?;
                let max_len = bytes.read_u16::<BigEndian>()?;
                actions.push(Action::Output(PseudoPort::make(port_code, max_len)?));
            }
            rest = &rest[len..];
        }
        Ok(actions)
    }

    fn move_controller_last(acts: &[Action]) -> Vec<Action> {
        let (to_ctrl, mut not_to_ctrl): (Vec<Action>, Vec<Action>) = acts
            .iter()
            .copied()
            .partition(|act| matches!(act, Action::Output(PseudoPort::Controller(_))));
        not_to_ctrl.extend(to_ctrl);
        not_to_ctrl
    }

    fn marshal(&self, bytes: &mut Vec<u8>) {
        bytes.put_u16(self.type_code() as u16);
        bytes.put_u16(self.size_of() as u16);
        match *self {
            Action::Output(pp) => {
                pp.marshal(bytes);
                bytes.put_u16(match pp {
                    PseudoPort::Controller(w) => w,
                    _ => 0,
                });
            }
        }
    }
}

/// How long before a flow entry expires.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Timeout {
    Permanent,
    ExpiresAfter(u16),
}

impl Timeout {
    fn of_int(tm: u16) -> Timeout {
        match tm {
            0 => Timeout::Permanent,
            d => Timeout::ExpiresAfter(d),
        }
    }

    fn to_int(&self) -> u16 {
        match *self {
            Timeout::Permanent => 0,
            Timeout::ExpiresAfter(d) => d,
        }
    }
}

/// Capabilities supported by the datapath.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub flow_stats: bool,
    pub table_stats: bool,
    pub port_stats: bool,
    pub stp: bool,
    pub ip_reasm: bool,
    pub queue_stats: bool,
    pub arp_match_ip: bool,
}

impl Capabilities {
    fn of_int(d: u32) -> Capabilities {
        let d = d as u64;
        Capabilities {
            flow_stats: test_bit(0, d),
            table_stats: test_bit(1, d),
            port_stats: test_bit(2, d),
            stp: test_bit(3, d),
            ip_reasm: test_bit(5, d),
            queue_stats: test_bit(6, d),
            arp_match_ip: test_bit(7, d),
        }
    }
}

/// Actions supported by the datapath.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportedActions {
    pub output: bool,
    pub set_vlan_id: bool,
    pub set_vlan_pcp: bool,
    pub strip_vlan: bool,
    pub set_dl_src: bool,
    pub set_dl_dst: bool,
    pub set_nw_src: bool,
    pub set_nw_dst: bool,
    pub set_nw_tos: bool,
    pub set_tp_src: bool,
    pub set_tp_dst: bool,
    pub enqueue: bool,
    pub vendor: bool,
}

impl SupportedActions {
    fn of_int(d: u32) -> SupportedActions {
        let d = d as u64;
        SupportedActions {
            output: test_bit(0, d),
            set_vlan_id: test_bit(1, d),
            set_vlan_pcp: test_bit(2, d),
            strip_vlan: test_bit(3, d),
            set_dl_src: test_bit(4, d),
            set_dl_dst: test_bit(5, d),
            set_nw_src: test_bit(6, d),
            set_nw_dst: test_bit(7, d),
            set_nw_tos: test_bit(8, d),
            set_tp_src: test_bit(9, d),
            set_tp_dst: test_bit(10, d),
            enqueue: test_bit(11, d),
            vendor: test_bit(12, d),
        }
    }
}

/// Switch features.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchFeatures {
    pub datapath_id: u64,
    pub num_buffers: u32,
    pub num_tables: u8,
    pub supported_capabilities: Capabilities,
    pub supported_actions: SupportedActions,
    pub ports: Vec<PortDesc>,
}

const OFP_SWITCH_FEATURES_SIZE: usize = 24;

impl MessageType for SwitchFeatures {
    fn size_of(&self) -> usize {
        OFP_SWITCH_FEATURES_SIZE + self.ports.len() * OFP_PHY_PORT_SIZE
    }

    fn parse(buf: &[u8]) -> Result<SwitchFeatures, DecodeError> {
        ensure_len("features reply", buf, OFP_SWITCH_FEATURES_SIZE)?;
        let mut bytes = Cursor::new(buf);
        let datapath_id = bytes.read_u64::<BigEndian>()?;
        let num_buffers = bytes.read_u32::<BigEndian>()?;
        let num_tables = bytes.read_u8()?;
        skip(&mut bytes, 3);
        let supported_capabilities = Capabilities::of_int(bytes.read_u32::<BigEndian>()?);
        let supported_actions = SupportedActions::of_int(bytes.read_u32::<BigEndian>()?);

        let port_bytes = remaining(&bytes);
        if port_bytes.len() % OFP_PHY_PORT_SIZE != 0 {
            return Err(DecodeError::invalid(
                "features reply",
                format!("{} port bytes is not a whole number of ports", port_bytes.len()),
            ));
        }
        let ports = port_bytes
            .chunks_exact(OFP_PHY_PORT_SIZE)
            .map(PortDesc::parse)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(SwitchFeatures {
            datapath_id,
            num_buffers,
            num_tables,
            supported_capabilities,
            supported_actions,
            ports,
        })
    }

    fn marshal(&self, bytes: &mut Vec<u8>) {
        bytes.put_u64(self.datapath_id);
        bytes.put_u32(self.num_buffers);
        bytes.put_u8(self.num_tables);
        bytes.put_bytes(0, 3);
        let c = &self.supported_capabilities;
        bytes.put_u32(
            [c.flow_stats, c.table_stats, c.port_stats, c.stp, false, c.ip_reasm, c.queue_stats, c.arp_match_ip]
                .iter()
                .enumerate()
                .fold(0, |acc, (i, &set)| if set { acc | 1 << i } else { acc }),
        );
        let a = &self.supported_actions;
        bytes.put_u32(
            [
                a.output,
                a.set_vlan_id,
                a.set_vlan_pcp,
                a.strip_vlan,
                a.set_dl_src,
                a.set_dl_dst,
                a.set_nw_src,
                a.set_nw_dst,
                a.set_nw_tos,
                a.set_tp_src,
                a.set_tp_dst,
                a.enqueue,
                a.vendor,
            ]
            .iter()
            .enumerate()
            .fold(0, |acc, (i, &set)| if set { acc | 1 << i } else { acc }),
        );
        for port in &self.ports {
            port.marshal(bytes);
        }
    }
}

/// Handling of IP fragments, from the switch configuration flags.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FragHandling {
    Normal,
    Drop,
    Reassemble,
}

/// Switch configuration, read with GET_CONFIG and written with SET_CONFIG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchConfig {
    pub frag: FragHandling,
    /// Bytes of each new packet sent to the controller.
    pub miss_send_len: u16,
}

impl MessageType for SwitchConfig {
    fn size_of(&self) -> usize {
        4
    }

    fn parse(buf: &[u8]) -> Result<SwitchConfig, DecodeError> {
        ensure_len("switch config", buf, 4)?;
        let mut bytes = Cursor::new(buf);
        let flags = bytes.read_u16::<BigEndian>()?;
        let frag = match flags & 3 {
            0 => FragHandling::Normal,
            1 => FragHandling::Drop,
            2 => FragHandling::Reassemble,
            f => {
                return Err(DecodeError::invalid(
                    "switch config",
                    format!("fragment handling {}", f),
                ))
            }
        };
        Ok(SwitchConfig {
            frag,
            miss_send_len: bytes.read_u16::<BigEndian>()?,
        })
    }

    fn marshal(&self, bytes: &mut Vec<u8>) {
        bytes.put_u16(match self.frag {
            FragHandling::Normal => 0,
            FragHandling::Drop => 1,
            FragHandling::Reassemble => 2,
        });
        bytes.put_u16(self.miss_send_len);
    }
}

/// Type of modification to perform on a flow table.
#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FlowModCmd {
    AddFlow,
    ModFlow,
    ModStrictFlow,
    DeleteFlow,
    DeleteStrictFlow,
}

impl FlowModCmd {
    fn of_int(cmd: u16) -> Result<FlowModCmd, DecodeError> {
        match cmd {
            0 => Ok(FlowModCmd::AddFlow),
            1 => Ok(FlowModCmd::ModFlow),
            2 => Ok(FlowModCmd::ModStrictFlow),
            3 => Ok(FlowModCmd::DeleteFlow),
            4 => Ok(FlowModCmd::DeleteStrictFlow),
            c => Err(DecodeError::invalid("flow mod", format!("command {}", c))),
        }
    }
}

/// Represents modifications to a flow table from the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowMod {
    pub command: FlowModCmd,
    pub pattern: Pattern,
    pub priority: u16,
    pub actions: Vec<Action>,
    pub cookie: u64,
    pub idle_timeout: Timeout,
    pub hard_timeout: Timeout,
    pub notify_when_removed: bool,
    pub apply_to_packet: Option<u32>,
    pub out_port: Option<PseudoPort>,
    pub check_overlap: bool,
}

const OFP_FLOW_MOD_SIZE: usize = OFP_MATCH_SIZE + 24;

impl FlowMod {
    fn flags_to_int(check_overlap: bool, notify_when_removed: bool) -> u16 {
        (if check_overlap { 1 << 1 } else { 0 }) | (if notify_when_removed { 1 << 0 } else { 0 })
    }

    fn check_overlap_of_flags(flags: u16) -> bool {
        2 & flags != 0
    }

    fn notify_when_removed_of_flags(flags: u16) -> bool {
        1 & flags != 0
    }
}

impl MessageType for FlowMod {
    fn size_of(&self) -> usize {
        OFP_FLOW_MOD_SIZE + Action::size_of_sequence(&self.actions)
    }

    fn parse(buf: &[u8]) -> Result<FlowMod, DecodeError> {
        ensure_len("flow mod", buf, OFP_FLOW_MOD_SIZE)?;
        let mut bytes = Cursor::new(buf);
        skip(&mut bytes, OFP_MATCH_SIZE as u64);
        let cookie = bytes.read_u64::<BigEndian>()?;
        let command = FlowModCmd::of_int(bytes.read_u16::<BigEndian>()?)?;
        let idle = Timeout::of_int(bytes.read_u16::<BigEndian>()?);
        let hard = Timeout::of_int(bytes.read_u16::<BigEndian>()?);
        let prio = bytes.read_u16::<BigEndian>()?;
        let buffer_id = bytes.read_i32::<BigEndian>()?;
        let out_port = PseudoPort::of_int(bytes.read_u16::<BigEndian>()?)?;
        let flags = bytes.read_u16::<BigEndian>()?;
        let actions = Action::parse_sequence(remaining(&bytes))?;
        Ok(FlowMod {
            command,
            pattern: Pattern::match_all(),
            priority: prio,
            actions,
            cookie,
            idle_timeout: idle,
            hard_timeout: hard,
            notify_when_removed: FlowMod::notify_when_removed_of_flags(flags),
            apply_to_packet: match buffer_id {
                -1 => None,
                n => Some(n as u32),
            },
            out_port,
            check_overlap: FlowMod::check_overlap_of_flags(flags),
        })
    }

    fn marshal(&self, bytes: &mut Vec<u8>) {
        self.pattern.marshal(bytes);
        bytes.put_u64(self.cookie);
        bytes.put_u16(self.command as u16);
        bytes.put_u16(self.idle_timeout.to_int());
        bytes.put_u16(self.hard_timeout.to_int());
        bytes.put_u16(self.priority);
        bytes.put_i32(match self.apply_to_packet {
            None => -1,
            Some(buf_id) => buf_id as i32,
        });
        match self.out_port {
            None => bytes.put_u16(OfpPort::OFPPNone as u16),
            Some(x) => x.marshal(bytes),
        }
        bytes.put_u16(FlowMod::flags_to_int(self.check_overlap, self.notify_when_removed));
        // OFPP_TABLE is only meaningful in a packet-out and is left out of installed flows.
        for act in Action::move_controller_last(&self.actions) {
            if act != Action::Output(PseudoPort::Table) {
                act.marshal(bytes);
            }
        }
    }
}

/// The data associated with a packet received by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Buffered(u32, Vec<u8>),
    NotBuffered(Vec<u8>),
}

impl Payload {
    pub fn size_of(&self) -> usize {
        match *self {
            Payload::Buffered(_, ref buf) | Payload::NotBuffered(ref buf) => buf.len(),
        }
    }

    pub fn data(&self) -> &[u8] {
        match *self {
            Payload::Buffered(_, ref buf) | Payload::NotBuffered(ref buf) => buf,
        }
    }
}

/// The reason a packet arrives at the controller.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PacketInReason {
    NoMatch,
    ExplicitSend,
}

/// Represents packets received by the datapath and sent to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketIn {
    pub input_payload: Payload,
    pub total_len: u16,
    pub port: u16,
    pub reason: PacketInReason,
}

const OFP_PACKET_IN_SIZE: usize = 10;

impl MessageType for PacketIn {
    fn size_of(&self) -> usize {
        OFP_PACKET_IN_SIZE + self.input_payload.size_of()
    }

    fn parse(buf: &[u8]) -> Result<PacketIn, DecodeError> {
        ensure_len("packet in", buf, OFP_PACKET_IN_SIZE)?;
        let mut bytes = Cursor::new(buf);
        let buf_id = match bytes.read_i32::<BigEndian>()? {
            -1 => None,
            n => Some(n as u32),
        };
        let total_len = bytes.read_u16::<BigEndian>()?;
        let port = bytes.read_u16::<BigEndian>()?;
        let reason = match bytes.read_u8()? {
            0 => PacketInReason::NoMatch,
            1 => PacketInReason::ExplicitSend,
            r => return Err(DecodeError::invalid("packet in", format!("reason {}", r))),
        };
        skip(&mut bytes, 1);
        let data = remaining(&bytes).to_vec();
        let payload = match buf_id {
            None => Payload::NotBuffered(data),
            Some(n) => Payload::Buffered(n, data),
        };
        Ok(PacketIn {
            input_payload: payload,
            total_len,
            port,
            reason,
        })
    }

    fn marshal(&self, bytes: &mut Vec<u8>) {
        bytes.put_i32(match self.input_payload {
            Payload::Buffered(n, _) => n as i32,
            Payload::NotBuffered(_) => -1,
        });
        bytes.put_u16(self.total_len);
        bytes.put_u16(self.port);
        bytes.put_u8(self.reason as u8);
        bytes.put_u8(0);
        bytes.put_slice(self.input_payload.data());
    }
}

/// Send a packet out of the datapath.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketOut {
    /// A buffered payload refers to a packet held by the switch; its data is not sent.
    pub output_payload: Payload,
    /// Port the packet arrived on, if any.
    pub port_id: Option<u16>,
    pub apply_actions: Vec<Action>,
}

const OFP_PACKET_OUT_SIZE: usize = 8;

impl MessageType for PacketOut {
    fn size_of(&self) -> usize {
        let data = match self.output_payload {
            Payload::Buffered(..) => 0,
            Payload::NotBuffered(ref buf) => buf.len(),
        };
        OFP_PACKET_OUT_SIZE + Action::size_of_sequence(&self.apply_actions) + data
    }

    fn parse(buf: &[u8]) -> Result<PacketOut, DecodeError> {
        ensure_len("packet out", buf, OFP_PACKET_OUT_SIZE)?;
        let mut bytes = Cursor::new(buf);
        let buf_id = bytes.read_i32::<BigEndian>()?;
        let in_port = bytes.read_u16::<BigEndian>()?;
        let actions_len = bytes.read_u16::<BigEndian>()? as usize;
        let rest = remaining(&bytes);
        ensure_len("packet out actions", rest, actions_len)?;
        let apply_actions = Action::parse_sequence(&rest[..actions_len])?;
        let data = rest[actions_len..].to_vec();
        Ok(PacketOut {
            output_payload: match buf_id {
                -1 => Payload::NotBuffered(data),
                n => Payload::Buffered(n as u32, data),
            },
            port_id: match in_port {
                p if p == OfpPort::OFPPNone as u16 => None,
                p => Some(p),
            },
            apply_actions,
        })
    }

    fn marshal(&self, bytes: &mut Vec<u8>) {
        bytes.put_i32(match self.output_payload {
            Payload::Buffered(n, _) => n as i32,
            Payload::NotBuffered(_) => -1,
        });
        bytes.put_u16(self.port_id.unwrap_or(OfpPort::OFPPNone as u16));
        bytes.put_u16(Action::size_of_sequence(&self.apply_actions) as u16);
        for act in Action::move_controller_last(&self.apply_actions) {
            act.marshal(bytes);
        }
        if let Payload::NotBuffered(ref data) = self.output_payload {
            bytes.put_slice(data);
        }
    }
}

/// STP state of a port.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StpState {
    Listen,
    Learn,
    Forward,
    Block,
}

/// Current state of a physical port. Not configurable by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortState {
    pub down: bool,
    pub stp_state: StpState,
}

impl PortState {
    fn of_int(d: u32) -> PortState {
        PortState {
            down: test_bit(0, d as u64),
            stp_state: match (d >> 8) & 3 {
                0 => StpState::Listen,
                1 => StpState::Learn,
                2 => StpState::Forward,
                _ => StpState::Block,
            },
        }
    }

    fn to_int(&self) -> u32 {
        (self.down as u32) | (self.stp_state as u32) << 8
    }
}

/// Features of physical ports available in a datapath.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortFeatures {
    pub f_10mbhd: bool,
    pub f_10mbfd: bool,
    pub f_100mbhd: bool,
    pub f_100mbfd: bool,
    pub f_1gbhd: bool,
    pub f_1gbfd: bool,
    pub f_10gbfd: bool,
    pub copper: bool,
    pub fiber: bool,
    pub autoneg: bool,
    pub pause: bool,
    pub pause_asym: bool,
}

impl PortFeatures {
    fn of_int(d: u32) -> PortFeatures {
        let d = d as u64;
        PortFeatures {
            f_10mbhd: test_bit(0, d),
            f_10mbfd: test_bit(1, d),
            f_100mbhd: test_bit(2, d),
            f_100mbfd: test_bit(3, d),
            f_1gbhd: test_bit(4, d),
            f_1gbfd: test_bit(5, d),
            f_10gbfd: test_bit(6, d),
            copper: test_bit(7, d),
            fiber: test_bit(8, d),
            autoneg: test_bit(9, d),
            pause: test_bit(10, d),
            pause_asym: test_bit(11, d),
        }
    }

    fn to_int(&self) -> u32 {
        [
            self.f_10mbhd,
            self.f_10mbfd,
            self.f_100mbhd,
            self.f_100mbfd,
            self.f_1gbhd,
            self.f_1gbfd,
            self.f_10gbfd,
            self.copper,
            self.fiber,
            self.autoneg,
            self.pause,
            self.pause_asym,
        ]
        .iter()
        .enumerate()
        .fold(0, |acc, (i, &set)| if set { acc | 1 << i } else { acc })
    }
}

/// Flags to indicate behavior of the physical port.
///
/// These flags are used both to describe the current configuration of a physical port,
/// and to configure a port's behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConfig {
    pub down: bool,
    pub no_stp: bool,
    pub no_recv: bool,
    pub no_recv_stp: bool,
    pub no_flood: bool,
    pub no_fwd: bool,
    pub no_packet_in: bool,
}

impl PortConfig {
    fn of_int(d: u32) -> PortConfig {
        let d = d as u64;
        PortConfig {
            down: test_bit(0, d),
            no_stp: test_bit(1, d),
            no_recv: test_bit(2, d),
            no_recv_stp: test_bit(3, d),
            no_flood: test_bit(4, d),
            no_fwd: test_bit(5, d),
            no_packet_in: test_bit(6, d),
        }
    }

    fn to_int(&self) -> u32 {
        [
            self.down,
            self.no_stp,
            self.no_recv,
            self.no_recv_stp,
            self.no_flood,
            self.no_fwd,
            self.no_packet_in,
        ]
        .iter()
        .enumerate()
        .fold(0, |acc, (i, &set)| if set { acc | 1 << i } else { acc })
    }
}

/// Description of a physical port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDesc {
    pub port_no: u16,
    pub hw_addr: [u8; 6],
    pub name: String,
    pub config: PortConfig,
    pub state: PortState,
    pub curr: PortFeatures,
    pub advertised: PortFeatures,
    pub supported: PortFeatures,
    pub peer: PortFeatures,
}

const OFP_PHY_PORT_SIZE: usize = 48;
const OFP_MAX_PORT_NAME_LEN: usize = 16;

impl PortDesc {
    fn parse(buf: &[u8]) -> Result<PortDesc, DecodeError> {
        ensure_len("port description", buf, OFP_PHY_PORT_SIZE)?;
        let mut bytes = Cursor::new(buf);
        let port_no = bytes.read_u16::<BigEndian>()?;
        let mut hw_addr = [0; 6];
        bytes.read_exact(&mut hw_addr)?;
        let mut name = [0; OFP_MAX_PORT_NAME_LEN];
        bytes.read_exact(&mut name)?;
        let name_len = name.iter().position(|&b| b == 0).unwrap_or(name.len());
        let name = String::from_utf8_lossy(&name[..name_len]).into_owned();
        let config = PortConfig::of_int(bytes.read_u32::<BigEndian>()?);
        let state = PortState::of_int(bytes.read_u32::<BigEndian>()?);
        let curr = PortFeatures::of_int(bytes.read_u32::<BigEndian>()?);
        let advertised = PortFeatures::of_int(bytes.read_u32::<BigEndian>()?);
        let supported = PortFeatures::of_int(bytes.read_u32::<BigEndian>()?);
        let peer = PortFeatures::of_int(bytes.read_u32::<BigEndian>()?);
        Ok(PortDesc {
            port_no,
            hw_addr,
            name,
            config,
            state,
            curr,
            advertised,
            supported,
            peer,
        })
    }

    fn marshal(&self, bytes: &mut Vec<u8>) {
        bytes.put_u16(self.port_no);
        bytes.put_slice(&self.hw_addr);
        let mut name = [0u8; OFP_MAX_PORT_NAME_LEN];
        let len = self.name.len().min(OFP_MAX_PORT_NAME_LEN - 1);
        name[..len].copy_from_slice(&self.name.as_bytes()[..len]);
        bytes.put_slice(&name);
        bytes.put_u32(self.config.to_int());
        bytes.put_u32(self.state.to_int());
        bytes.put_u32(self.curr.to_int());
        bytes.put_u32(self.advertised.to_int());
        bytes.put_u32(self.supported.to_int());
        bytes.put_u32(self.peer.to_int());
    }
}

/// What changed about a physical port.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PortReason {
    PortAdd,
    PortDelete,
    PortModify,
}

/// A physical port has changed in the datapath.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortStatus {
    pub reason: PortReason,
    pub desc: PortDesc,
}

impl MessageType for PortStatus {
    fn size_of(&self) -> usize {
        8 + OFP_PHY_PORT_SIZE
    }

    fn parse(buf: &[u8]) -> Result<PortStatus, DecodeError> {
        ensure_len("port status", buf, 8 + OFP_PHY_PORT_SIZE)?;
        let reason = match buf[0] {
            0 => PortReason::PortAdd,
            1 => PortReason::PortDelete,
            2 => PortReason::PortModify,
            r => return Err(DecodeError::invalid("port status", format!("reason {}", r))),
        };
        Ok(PortStatus {
            reason,
            desc: PortDesc::parse(&buf[8..])?,
        })
    }

    fn marshal(&self, bytes: &mut Vec<u8>) {
        bytes.put_u8(self.reason as u8);
        bytes.put_bytes(0, 7);
        self.desc.marshal(bytes);
    }
}

/// An error reported by the switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMsg {
    pub err_type: u16,
    pub code: u16,
    /// At least the first 64 bytes of the failed request, or an ASCII explanation.
    pub data: Vec<u8>,
}

impl MessageType for ErrorMsg {
    fn size_of(&self) -> usize {
        4 + self.data.len()
    }

    fn parse(buf: &[u8]) -> Result<ErrorMsg, DecodeError> {
        ensure_len("error message", buf, 4)?;
        let mut bytes = Cursor::new(buf);
        Ok(ErrorMsg {
            err_type: bytes.read_u16::<BigEndian>()?,
            code: bytes.read_u16::<BigEndian>()?,
            data: remaining(&bytes).to_vec(),
        })
    }

    fn marshal(&self, bytes: &mut Vec<u8>) {
        bytes.put_u16(self.err_type);
        bytes.put_u16(self.code);
        bytes.put_slice(&self.data);
    }
}

/// Encapsulates handling of messages implementing `MessageType` trait.
pub mod message {
    use super::*;
    use crate::ofp_header::OfpHeader;
    use crate::ofp_message::{MessageCodec, OfpMessage};

    /// Abstractions of OpenFlow messages mapping to message codes.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Message {
        Hello,
        Error(ErrorMsg),
        EchoRequest(Vec<u8>),
        EchoReply(Vec<u8>),
        FeaturesReq,
        FeaturesReply(SwitchFeatures),
        GetConfigReq,
        GetConfigReply(SwitchConfig),
        SetConfig(SwitchConfig),
        PacketIn(PacketIn),
        PortStatus(PortStatus),
        PacketOut(PacketOut),
        FlowMod(FlowMod),
        BarrierRequest,
        BarrierReply,
    }

    impl Message {
        /// Map `Message` to associated OpenFlow message type code `MsgCode`.
        pub fn msg_code_of_message(&self) -> MsgCode {
            match *self {
                Message::Hello => MsgCode::Hello,
                Message::Error(_) => MsgCode::Error,
                Message::EchoRequest(_) => MsgCode::EchoReq,
                Message::EchoReply(_) => MsgCode::EchoResp,
                Message::FeaturesReq => MsgCode::FeaturesReq,
                Message::FeaturesReply(_) => MsgCode::FeaturesResp,
                Message::GetConfigReq => MsgCode::GetConfigReq,
                Message::GetConfigReply(_) => MsgCode::GetConfigResp,
                Message::SetConfig(_) => MsgCode::SetConfig,
                Message::PacketIn(_) => MsgCode::PacketIn,
                Message::PortStatus(_) => MsgCode::PortStatus,
                Message::PacketOut(_) => MsgCode::PacketOut,
                Message::FlowMod(_) => MsgCode::FlowMod,
                Message::BarrierRequest => MsgCode::BarrierReq,
                Message::BarrierReply => MsgCode::BarrierResp,
            }
        }

        /// Return the byte-size of a `Message`, header included.
        pub fn size_of(&self) -> usize {
            OfpHeader::size()
                + match *self {
                    Message::Hello
                    | Message::FeaturesReq
                    | Message::GetConfigReq
                    | Message::BarrierRequest
                    | Message::BarrierReply => 0,
                    Message::EchoRequest(ref buf) | Message::EchoReply(ref buf) => buf.len(),
                    Message::Error(ref err) => err.size_of(),
                    Message::FeaturesReply(ref features) => features.size_of(),
                    Message::GetConfigReply(ref config) | Message::SetConfig(ref config) => {
                        config.size_of()
                    }
                    Message::PacketIn(ref packet_in) => packet_in.size_of(),
                    Message::PortStatus(ref ps) => ps.size_of(),
                    Message::PacketOut(ref packet_out) => packet_out.size_of(),
                    Message::FlowMod(ref flow_mod) => flow_mod.size_of(),
                }
        }

        /// Parse the body of a message whose header is `header`.
        ///
        /// Fails on type codes without a `Message` variant.
        pub fn parse(header: &OfpHeader, buf: &[u8]) -> Result<Message, DecodeError> {
            let msg = match MsgCode::try_from(header.type_code())? {
                MsgCode::Hello => Message::Hello,
                MsgCode::Error => Message::Error(ErrorMsg::parse(buf)?),
                MsgCode::EchoReq => Message::EchoRequest(buf.to_vec()),
                MsgCode::EchoResp => Message::EchoReply(buf.to_vec()),
                MsgCode::FeaturesReq => Message::FeaturesReq,
                MsgCode::FeaturesResp => Message::FeaturesReply(SwitchFeatures::parse(buf)?),
                MsgCode::GetConfigReq => Message::GetConfigReq,
                MsgCode::GetConfigResp => Message::GetConfigReply(SwitchConfig::parse(buf)?),
                MsgCode::SetConfig => Message::SetConfig(SwitchConfig::parse(buf)?),
                MsgCode::PacketIn => Message::PacketIn(PacketIn::parse(buf)?),
                MsgCode::PortStatus => Message::PortStatus(PortStatus::parse(buf)?),
                MsgCode::PacketOut => Message::PacketOut(PacketOut::parse(buf)?),
                MsgCode::FlowMod => Message::FlowMod(FlowMod::parse(buf)?),
                MsgCode::BarrierReq => Message::BarrierRequest,
                MsgCode::BarrierResp => Message::BarrierReply,
                code => {
                    return Err(DecodeError::invalid(
                        "message type",
                        format!("{:?} is not supported", code),
                    ))
                }
            };
            Ok(msg)
        }
    }

    impl OfpMessage for Message {
        fn msg_code(&self) -> u8 {
            self.msg_code_of_message() as u8
        }

        fn marshal_body(&self, bytes: &mut Vec<u8>) {
            match *self {
                Message::Hello
                | Message::FeaturesReq
                | Message::GetConfigReq
                | Message::BarrierRequest
                | Message::BarrierReply => (),
                Message::EchoRequest(ref buf) | Message::EchoReply(ref buf) => {
                    bytes.extend_from_slice(buf)
                }
                Message::Error(ref err) => err.marshal(bytes),
                Message::FeaturesReply(ref features) => features.marshal(bytes),
                Message::GetConfigReply(ref config) | Message::SetConfig(ref config) => {
                    config.marshal(bytes)
                }
                Message::PacketIn(ref packet_in) => packet_in.marshal(bytes),
                Message::PortStatus(ref sts) => sts.marshal(bytes),
                Message::PacketOut(ref packet_out) => packet_out.marshal(bytes),
                Message::FlowMod(ref flow_mod) => flow_mod.marshal(bytes),
            }
        }
    }

    /// Codec for OpenFlow 1.0: decoders for every message a switch sends, and the
    /// request/reply pairs of the protocol.
    pub fn codec() -> MessageCodec<Message> {
        let mut codec = MessageCodec::new();
        for code in [
            MsgCode::Hello,
            MsgCode::Error,
            MsgCode::EchoReq,
            MsgCode::EchoResp,
            MsgCode::FeaturesResp,
            MsgCode::GetConfigResp,
            MsgCode::PacketIn,
            MsgCode::PortStatus,
            MsgCode::BarrierResp,
        ] {
            codec.register(code as u8, Message::parse);
        }
        for (request, reply) in [
            (MsgCode::EchoReq, MsgCode::EchoResp),
            (MsgCode::FeaturesReq, MsgCode::FeaturesResp),
            (MsgCode::GetConfigReq, MsgCode::GetConfigResp),
            (MsgCode::BarrierReq, MsgCode::BarrierResp),
            (MsgCode::StatsReq, MsgCode::StatsResp),
            (MsgCode::QueueGetConfigReq, MsgCode::QueueGetConfigResp),
        ] {
            codec.register_reply(request as u8, reply as u8);
        }
        codec
    }

    /// Return a `FlowMod` adding a flow parameterized by the given `priority`, `pattern`,
    /// and `actions`.
    pub fn add_flow(prio: u16, pattern: Pattern, actions: Vec<Action>) -> FlowMod {
        FlowMod {
            command: FlowModCmd::AddFlow,
            pattern,
            priority: prio,
            actions,
            cookie: 0,
            idle_timeout: Timeout::Permanent,
            hard_timeout: Timeout::Permanent,
            notify_when_removed: false,
            out_port: None,
            apply_to_packet: None,
            check_overlap: false,
        }
    }
}
