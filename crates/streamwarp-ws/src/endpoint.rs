//! Shared WebSocket endpoint machinery.
//!
//! Both the server session and the client drive the same engine: an
//! incremental frame assembler feeding role-checked events, and a
//! shared state block holding the session state, the close timer and
//! the outbound framing parameters. Role differences are confined to
//! masking (clients mask, servers must not) and to the handshake,
//! which lives with the adapters.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use byteorder::{BigEndian, ByteOrder};
use tracing::debug;

use streamwarp_core::{config::Config, error::Error};
use streamwarp_net::TcpSession;
use streamwarp_service::Timer;

use crate::frame::{
    apply_mask, close_code, encode_frame, new_mask_key, parse_frame_header, OpCode,
};

/// A delivered WebSocket application message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsMessage<'a> {
    /// UTF-8 text message.
    Text(&'a str),
    /// Binary message.
    Binary(&'a [u8]),
}

impl<'a> WsMessage<'a> {
    /// Message payload as raw bytes.
    pub fn as_bytes(&self) -> &'a [u8] {
        match self {
            WsMessage::Text(text) => text.as_bytes(),
            WsMessage::Binary(bytes) => bytes,
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    /// Whether this is a text message.
    pub fn is_text(&self) -> bool {
        matches!(self, WsMessage::Text(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum WsState {
    Handshake = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl WsState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WsState::Handshake,
            1 => WsState::Open,
            2 => WsState::Closing,
            _ => WsState::Closed,
        }
    }
}

/// State shared between an endpoint's adapter and its public handles.
pub(crate) struct WsShared {
    /// Cleared on disconnect to break the handler → shared → session
    /// reference cycle.
    transport: Mutex<Option<TcpSession>>,
    role: Role,
    state: AtomicU8,
    close_reported: AtomicBool,
    close_timed_out: AtomicBool,
    close_timer: Mutex<Option<Timer>>,
    fragment_threshold: usize,
    max_message_size: usize,
    close_timeout: Duration,
}

impl WsShared {
    pub(crate) fn new(transport: TcpSession, role: Role, config: &Config) -> Arc<Self> {
        Arc::new(Self {
            transport: Mutex::new(Some(transport)),
            role,
            state: AtomicU8::new(WsState::Handshake as u8),
            close_reported: AtomicBool::new(false),
            close_timed_out: AtomicBool::new(false),
            close_timer: Mutex::new(None),
            fragment_threshold: config.ws_fragment_threshold.clamp(1, 65536),
            max_message_size: config.ws_max_message_size,
            close_timeout: config.ws_close_timeout,
        })
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    pub(crate) fn state(&self) -> WsState {
        WsState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: WsState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: WsState, to: WsState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub(crate) fn transport(&self) -> Option<TcpSession> {
        self.transport.lock().unwrap().clone()
    }

    pub(crate) fn clear_transport(&self) {
        *self.transport.lock().unwrap() = None;
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state() == WsState::Open
    }

    fn mask_for_write(&self) -> Option<[u8; 4]> {
        match self.role {
            Role::Client => Some(new_mask_key()),
            Role::Server => None,
        }
    }

    /// Encodes a data message, fragmenting above the threshold, and
    /// queues it on the transport.
    pub(crate) fn send_message(&self, opcode: OpCode, payload: &[u8]) -> bool {
        if !self.is_open() {
            return false;
        }
        let Some(transport) = self.transport() else {
            return false;
        };
        transport.send_async(&self.encode_message(opcode, payload))
    }

    /// Synchronous variant: blocks until the frames drain.
    pub(crate) fn send_message_sync(&self, opcode: OpCode, payload: &[u8]) -> usize {
        if !self.is_open() {
            return 0;
        }
        let Some(transport) = self.transport() else {
            return 0;
        };
        if transport.send(&self.encode_message(opcode, payload)) > 0 {
            payload.len()
        } else {
            0
        }
    }

    /// Frames a whole message; used by sends and by server multicast
    /// (server frames carry no mask, so one encoding fans out).
    pub(crate) fn encode_message(&self, opcode: OpCode, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + 16);
        if payload.len() <= self.fragment_threshold {
            encode_frame(&mut out, true, opcode, self.mask_for_write(), payload);
            return out;
        }
        let mut chunks = payload.chunks(self.fragment_threshold).peekable();
        let mut first = true;
        while let Some(chunk) = chunks.next() {
            let fin = chunks.peek().is_none();
            let op = if first { opcode } else { OpCode::Continuation };
            encode_frame(&mut out, fin, op, self.mask_for_write(), chunk);
            first = false;
        }
        out
    }

    /// Queues a control frame. Control payloads are capped at 125
    /// bytes by the RFC; larger ones are rejected.
    pub(crate) fn send_control(&self, opcode: OpCode, payload: &[u8]) -> bool {
        if payload.len() > 125 {
            return false;
        }
        let state = self.state();
        if state != WsState::Open && state != WsState::Closing {
            return false;
        }
        let Some(transport) = self.transport() else {
            return false;
        };
        let mut out = Vec::with_capacity(payload.len() + 8);
        encode_frame(&mut out, true, opcode, self.mask_for_write(), payload);
        transport.send_async(&out)
    }

    fn send_close_frame(&self, code: Option<u16>, reason: &str) -> bool {
        let Some(transport) = self.transport() else {
            return false;
        };
        let mut payload = Vec::with_capacity(2 + reason.len());
        if let Some(code) = code {
            let mut bytes = [0u8; 2];
            BigEndian::write_u16(&mut bytes, code);
            payload.extend_from_slice(&bytes);
            payload.extend_from_slice(reason.as_bytes());
        }
        payload.truncate(125);
        let mut out = Vec::with_capacity(payload.len() + 8);
        encode_frame(&mut out, true, OpCode::Close, self.mask_for_write(), &payload);
        transport.send_async(&out)
    }

    /// Initiates the close handshake: `open → closing`, close frame
    /// out, close timer armed. Receipt of the peer's close (or the
    /// timer) finishes the transport.
    pub(crate) fn close_async(self: &Arc<Self>, code: u16, reason: &str) -> bool {
        if !self.transition(WsState::Open, WsState::Closing) {
            return false;
        }
        self.send_close_frame(Some(code), reason);
        self.arm_close_timer();
        true
    }

    fn arm_close_timer(self: &Arc<Self>) {
        let Some(transport) = self.transport() else {
            return;
        };
        let weak: Weak<WsShared> = Arc::downgrade(self);
        let timer = Timer::with_action(transport.service().clone(), move |cancelled| {
            if cancelled {
                return;
            }
            if let Some(shared) = weak.upgrade() {
                debug!("close handshake timed out");
                shared.close_timed_out.store(true, Ordering::Release);
                if let Some(transport) = shared.transport() {
                    transport.disconnect_async();
                }
            }
        });
        timer.setup_after(self.close_timeout);
        timer.wait_async();
        *self.close_timer.lock().unwrap() = Some(timer);
    }

    pub(crate) fn cancel_close_timer(&self) {
        if let Some(timer) = self.close_timer.lock().unwrap().take() {
            timer.cancel();
        }
    }

    pub(crate) fn take_close_timed_out(&self) -> bool {
        self.close_timed_out.swap(false, Ordering::AcqRel)
    }

    /// Protocol failure: report close code to the peer, suppress any
    /// later `on_ws_close`, tear the transport down.
    fn fail(&self, code: u16) {
        self.close_reported.store(true, Ordering::Release);
        let state = self.state();
        if state == WsState::Open || state == WsState::Closing {
            self.set_state(WsState::Closing);
            self.send_close_frame(Some(code), "");
        }
        if let Some(transport) = self.transport() {
            transport.disconnect_async();
        }
    }
}

/// Notifications the engine hands to the role adapters for emission.
pub(crate) enum WsNotice<'a> {
    Received(WsMessage<'a>),
    Ping(&'a [u8]),
    Pong(&'a [u8]),
    Close { code: u16, reason: &'a str },
    Failed { error: Error },
}

#[derive(Debug)]
enum Inbound {
    Message(OpCode, Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close { code: Option<u16>, reason: String },
}

/// Incremental frame reassembly for one direction of one endpoint.
/// Strand-confined; owned by the session adapter.
#[derive(Default)]
pub(crate) struct FrameAssembler {
    incoming: Vec<u8>,
    fragments: Vec<u8>,
    fragment_opcode: Option<OpCode>,
}

impl FrameAssembler {
    /// Decodes as many complete frames as `data` completes, enforcing
    /// the role and size rules. Errors carry the close code to report.
    fn decode(
        &mut self,
        data: &[u8],
        role: Role,
        max_message: usize,
    ) -> Result<Vec<Inbound>, (u16, String)> {
        self.incoming.extend_from_slice(data);
        let mut events = Vec::new();
        loop {
            let header = match parse_frame_header(&self.incoming) {
                Ok(Some(header)) => header,
                Ok(None) => break,
                Err(e) => return Err((close_code::PROTOCOL_ERROR, format!("bad frame header: {e:?}"))),
            };
            if header.rsv != 0 {
                return Err((close_code::PROTOCOL_ERROR, "reserved bits set".into()));
            }
            match role {
                Role::Server if header.mask.is_none() => {
                    return Err((close_code::PROTOCOL_ERROR, "client frame not masked".into()));
                }
                Role::Client if header.mask.is_some() => {
                    return Err((close_code::PROTOCOL_ERROR, "server frame masked".into()));
                }
                _ => {}
            }
            if header.opcode.is_control() {
                if !header.fin {
                    return Err((close_code::PROTOCOL_ERROR, "fragmented control frame".into()));
                }
                if header.payload_len > 125 {
                    return Err((close_code::PROTOCOL_ERROR, "control payload over 125 bytes".into()));
                }
            }
            if max_message > 0 && header.payload_len > max_message as u64 {
                return Err((
                    close_code::MESSAGE_TOO_BIG,
                    format!("frame of {} bytes exceeds limit", header.payload_len),
                ));
            }
            let total = header.header_len + header.payload_len as usize;
            if self.incoming.len() < total {
                break;
            }
            let mut payload = self.incoming[header.header_len..total].to_vec();
            self.incoming.drain(..total);
            if let Some(key) = header.mask {
                apply_mask(key, &mut payload);
            }
            match header.opcode {
                OpCode::Text | OpCode::Binary => {
                    if self.fragment_opcode.is_some() {
                        return Err((
                            close_code::PROTOCOL_ERROR,
                            "data frame while a fragmented message is open".into(),
                        ));
                    }
                    if header.fin {
                        events.push(Inbound::Message(header.opcode, payload));
                    } else {
                        self.fragment_opcode = Some(header.opcode);
                        self.fragments = payload;
                    }
                }
                OpCode::Continuation => {
                    let Some(opcode) = self.fragment_opcode else {
                        return Err((
                            close_code::PROTOCOL_ERROR,
                            "continuation without a fragmented message".into(),
                        ));
                    };
                    if max_message > 0 && self.fragments.len() + payload.len() > max_message {
                        return Err((
                            close_code::MESSAGE_TOO_BIG,
                            "reassembled message exceeds limit".into(),
                        ));
                    }
                    self.fragments.extend_from_slice(&payload);
                    if header.fin {
                        self.fragment_opcode = None;
                        events.push(Inbound::Message(opcode, std::mem::take(&mut self.fragments)));
                    }
                }
                OpCode::Ping => events.push(Inbound::Ping(payload)),
                OpCode::Pong => events.push(Inbound::Pong(payload)),
                OpCode::Close => {
                    if payload.len() == 1 {
                        return Err((close_code::PROTOCOL_ERROR, "close payload of one byte".into()));
                    }
                    let code = if payload.len() >= 2 {
                        Some(BigEndian::read_u16(&payload[..2]))
                    } else {
                        None
                    };
                    let reason = match std::str::from_utf8(&payload[payload.len().min(2)..]) {
                        Ok(reason) => reason.to_owned(),
                        Err(_) => {
                            return Err((
                                close_code::INVALID_PAYLOAD,
                                "close reason is not UTF-8".into(),
                            ));
                        }
                    };
                    events.push(Inbound::Close { code, reason });
                    break;
                }
            }
        }
        Ok(events)
    }
}

/// One endpoint's protocol engine: shared state plus reassembly.
pub(crate) struct WsEngine {
    pub(crate) shared: Arc<WsShared>,
    assembler: FrameAssembler,
}

impl WsEngine {
    pub(crate) fn new(shared: Arc<WsShared>) -> Self {
        Self { shared, assembler: FrameAssembler::default() }
    }

    /// Processes open-state bytes: decodes frames, answers control
    /// frames, runs the close handshake, and hands display-worthy
    /// notices to `notify` for handler emission.
    pub(crate) fn handle_frames(&mut self, data: &[u8], mut notify: impl FnMut(WsNotice<'_>)) {
        let decoded = self.assembler.decode(
            data,
            self.shared.role(),
            self.shared.max_message_size(),
        );
        let events = match decoded {
            Ok(events) => events,
            Err((code, message)) => {
                self.shared.fail(code);
                notify(WsNotice::Failed { error: Error::WsProtocol(message) });
                return;
            }
        };
        for event in events {
            match event {
                Inbound::Message(opcode, payload) => {
                    if opcode == OpCode::Text {
                        match std::str::from_utf8(&payload) {
                            Ok(text) => notify(WsNotice::Received(WsMessage::Text(text))),
                            Err(_) => {
                                self.shared.fail(close_code::INVALID_PAYLOAD);
                                notify(WsNotice::Failed {
                                    error: Error::WsProtocol(
                                        "text message is not valid UTF-8".into(),
                                    ),
                                });
                                return;
                            }
                        }
                    } else {
                        notify(WsNotice::Received(WsMessage::Binary(&payload)));
                    }
                }
                Inbound::Ping(payload) => {
                    // Pong mirrors the ping payload exactly.
                    self.shared.send_control(OpCode::Pong, &payload);
                    notify(WsNotice::Ping(&payload));
                }
                Inbound::Pong(payload) => notify(WsNotice::Pong(&payload)),
                Inbound::Close { code, reason } => {
                    self.shared.cancel_close_timer();
                    let peer_initiated =
                        self.shared.transition(WsState::Open, WsState::Closing);
                    if peer_initiated {
                        self.shared.send_close_frame(code, &reason);
                    }
                    if !self.shared.close_reported.swap(true, Ordering::AcqRel) {
                        notify(WsNotice::Close {
                            code: code.unwrap_or(close_code::NO_STATUS),
                            reason: &reason,
                        });
                    }
                    if let Some(transport) = self.shared.transport() {
                        transport.disconnect_async();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_frame;

    fn masked(fin: bool, opcode: OpCode, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        encode_frame(&mut out, fin, opcode, Some(new_mask_key()), payload);
        out
    }

    #[test]
    fn reassembles_fragmented_text() {
        let mut assembler = FrameAssembler::default();
        let mut bytes = masked(false, OpCode::Text, b"Hel");
        bytes.extend(masked(false, OpCode::Continuation, b"lo "));
        bytes.extend(masked(true, OpCode::Continuation, b"World"));
        let events = assembler.decode(&bytes, Role::Server, 0).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            Inbound::Message(OpCode::Text, payload) => assert_eq!(payload, b"Hello World"),
            _ => panic!("expected a text message"),
        }
    }

    #[test]
    fn control_frames_interleave_with_fragments() {
        let mut assembler = FrameAssembler::default();
        let mut bytes = masked(false, OpCode::Binary, b"ab");
        bytes.extend(masked(true, OpCode::Ping, b"ping!"));
        bytes.extend(masked(true, OpCode::Continuation, b"cd"));
        let events = assembler.decode(&bytes, Role::Server, 0).unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], Inbound::Ping(p) if p == b"ping!"));
        assert!(matches!(&events[1], Inbound::Message(OpCode::Binary, p) if p == b"abcd"));
    }

    #[test]
    fn server_rejects_unmasked_frames() {
        let mut assembler = FrameAssembler::default();
        let mut bytes = Vec::new();
        encode_frame(&mut bytes, true, OpCode::Text, None, b"hi");
        let err = assembler.decode(&bytes, Role::Server, 0).unwrap_err();
        assert_eq!(err.0, close_code::PROTOCOL_ERROR);
    }

    #[test]
    fn client_rejects_masked_frames() {
        let mut assembler = FrameAssembler::default();
        let bytes = masked(true, OpCode::Text, b"hi");
        let err = assembler.decode(&bytes, Role::Client, 0).unwrap_err();
        assert_eq!(err.0, close_code::PROTOCOL_ERROR);
    }

    #[test]
    fn oversized_frame_reports_1009() {
        let mut assembler = FrameAssembler::default();
        let bytes = masked(true, OpCode::Binary, &vec![0u8; 200]);
        let err = assembler.decode(&bytes, Role::Server, 100).unwrap_err();
        assert_eq!(err.0, close_code::MESSAGE_TOO_BIG);
    }

    #[test]
    fn fragmented_control_frame_reports_1002() {
        let mut assembler = FrameAssembler::default();
        let bytes = masked(false, OpCode::Ping, b"x");
        let err = assembler.decode(&bytes, Role::Server, 0).unwrap_err();
        assert_eq!(err.0, close_code::PROTOCOL_ERROR);
    }

    #[test]
    fn continuation_without_message_reports_1002() {
        let mut assembler = FrameAssembler::default();
        let bytes = masked(true, OpCode::Continuation, b"x");
        let err = assembler.decode(&bytes, Role::Server, 0).unwrap_err();
        assert_eq!(err.0, close_code::PROTOCOL_ERROR);
    }

    #[test]
    fn close_with_code_and_reason() {
        let mut assembler = FrameAssembler::default();
        let mut payload = vec![0x03, 0xe8];
        payload.extend_from_slice(b"bye");
        let bytes = masked(true, OpCode::Close, &payload);
        let events = assembler.decode(&bytes, Role::Server, 0).unwrap();
        assert!(matches!(
            &events[0],
            Inbound::Close { code: Some(1000), reason } if reason == "bye"
        ));
    }

    #[test]
    fn frames_split_across_reads() {
        let mut assembler = FrameAssembler::default();
        let bytes = masked(true, OpCode::Text, b"split me");
        let (a, b) = bytes.split_at(3);
        assert!(assembler.decode(a, Role::Server, 0).unwrap().is_empty());
        let events = assembler.decode(b, Role::Server, 0).unwrap();
        assert_eq!(events.len(), 1);
    }
}
