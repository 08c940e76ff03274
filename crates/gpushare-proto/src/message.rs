//! Fixed-layout protocol frames.
//!
//! Every message on the wire is exactly [`FRAME_LEN`] bytes: a one-byte
//! type tag, two NUL-padded label fields (Kubernetes pod name and
//! namespace, or `"none"`), a 64-bit id in host byte order, and a short
//! NUL-padded data field. The data field carries the client id as a
//! 16-character hex string in registration replies, or a decimal time
//! quantum in `SetTq` frames. The protocol never leaves the host, so no
//! byte swapping is performed.

use std::fmt;

/// Capacity of the pod name and pod namespace fields, including the
/// terminating NUL.
pub const LABEL_LEN: usize = 254;

/// Capacity of the data field, including the terminating NUL. Sized to
/// hold a 16-character hex client id.
pub const DATA_LEN: usize = 20;

/// Total size of one frame on the wire.
pub const FRAME_LEN: usize = 1 + LABEL_LEN + LABEL_LEN + 8 + DATA_LEN;

const NAME_OFF: usize = 1;
const NAMESPACE_OFF: usize = NAME_OFF + LABEL_LEN;
const ID_OFF: usize = NAMESPACE_OFF + LABEL_LEN;
const DATA_OFF: usize = ID_OFF + 8;

/// Errors produced while decoding or interpreting a frame.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum WireError {
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("frame is {0} bytes, expected {FRAME_LEN}")]
    BadLength(usize),
    #[error("data field does not contain a valid client id")]
    BadClientId,
    #[error("data field does not contain a valid time quantum")]
    BadQuantum,
}

/// Protocol message types. The numeric values are part of the wire
/// format and must not be reordered.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Client -> scheduler: first message on a connection.
    Register = 1,
    /// Scheduler mode broadcast / control: anti-thrash scheduling on.
    SchedOn = 2,
    /// Scheduler mode broadcast / control: permissive mode.
    SchedOff = 3,
    /// Client -> scheduler: request the GPU lock.
    ReqLock = 4,
    /// Scheduler -> client: the lock is yours.
    LockOk = 5,
    /// Scheduler -> client: finish up and release the lock.
    DropLock = 6,
    /// Client -> scheduler: the lock has been released.
    LockReleased = 7,
    /// Control -> scheduler: change the time quantum.
    SetTq = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            1 => Ok(MessageType::Register),
            2 => Ok(MessageType::SchedOn),
            3 => Ok(MessageType::SchedOff),
            4 => Ok(MessageType::ReqLock),
            5 => Ok(MessageType::LockOk),
            6 => Ok(MessageType::DropLock),
            7 => Ok(MessageType::LockReleased),
            8 => Ok(MessageType::SetTq),
            other => Err(WireError::UnknownType(other)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageType::Register => "REGISTER",
            MessageType::SchedOn => "SCHED_ON",
            MessageType::SchedOff => "SCHED_OFF",
            MessageType::ReqLock => "REQ_LOCK",
            MessageType::LockOk => "LOCK_OK",
            MessageType::DropLock => "DROP_LOCK",
            MessageType::LockReleased => "LOCK_RELEASED",
            MessageType::SetTq => "SET_TQ",
        };
        f.write_str(s)
    }
}

/// One protocol frame in decoded form.
///
/// The label fields identify the sending client in scheduler logs and
/// carry no protocol meaning. Strings longer than the field capacity are
/// truncated on encode; the fields are always NUL-terminated on the
/// wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageType,
    pub pod_name: String,
    pub pod_namespace: String,
    pub id: u64,
    pub data: String,
}

impl Message {
    /// A frame with empty labels and data.
    pub fn new(kind: MessageType, id: u64) -> Self {
        Message {
            kind,
            pod_name: String::new(),
            pod_namespace: String::new(),
            id,
            data: String::new(),
        }
    }

    /// Serialize into a wire frame.
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut buf = [0u8; FRAME_LEN];
        buf[0] = self.kind as u8;
        put_padded(&mut buf[NAME_OFF..NAME_OFF + LABEL_LEN], &self.pod_name);
        put_padded(
            &mut buf[NAMESPACE_OFF..NAMESPACE_OFF + LABEL_LEN],
            &self.pod_namespace,
        );
        buf[ID_OFF..ID_OFF + 8].copy_from_slice(&self.id.to_ne_bytes());
        put_padded(&mut buf[DATA_OFF..DATA_OFF + DATA_LEN], &self.data);
        buf
    }

    /// Deserialize a wire frame.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() != FRAME_LEN {
            return Err(WireError::BadLength(buf.len()));
        }
        let kind = MessageType::try_from(buf[0])?;
        let mut id_bytes = [0u8; 8];
        id_bytes.copy_from_slice(&buf[ID_OFF..ID_OFF + 8]);
        Ok(Message {
            kind,
            pod_name: take_padded(&buf[NAME_OFF..NAME_OFF + LABEL_LEN]),
            pod_namespace: take_padded(&buf[NAMESPACE_OFF..NAMESPACE_OFF + LABEL_LEN]),
            id: u64::from_ne_bytes(id_bytes),
            data: take_padded(&buf[DATA_OFF..DATA_OFF + DATA_LEN]),
        })
    }

    /// Store a client id in the data field as 16 lowercase hex digits,
    /// the form used by registration replies.
    pub fn set_client_id(&mut self, client_id: u64) {
        self.data = format!("{client_id:016x}");
    }

    /// Parse a client id out of the data field of a registration reply.
    pub fn client_id(&self) -> Result<u64, WireError> {
        if self.data.len() != 16 {
            return Err(WireError::BadClientId);
        }
        u64::from_str_radix(&self.data, 16).map_err(|_| WireError::BadClientId)
    }

    /// Store a time quantum in the data field as a decimal string.
    pub fn set_quantum(&mut self, quantum_s: u64) {
        self.data = quantum_s.to_string();
    }

    /// Parse the time quantum out of the data field of a `SetTq` frame.
    /// Non-positive and malformed values are reported as errors; the
    /// scheduler ignores such frames.
    pub fn quantum(&self) -> Result<u64, WireError> {
        match self.data.trim().parse::<i64>() {
            Ok(q) if q > 0 => Ok(q as u64),
            _ => Err(WireError::BadQuantum),
        }
    }
}

/// Copy `s` into `field`, truncating so that a NUL terminator always
/// fits. `field` is assumed to be zeroed.
fn put_padded(field: &mut [u8], s: &str) {
    let take = s.len().min(field.len() - 1);
    field[..take].copy_from_slice(&s.as_bytes()[..take]);
}

/// Read a NUL-padded field back into a `String`, stopping at the first
/// NUL. Labels are free-form, so invalid UTF-8 is replaced rather than
/// rejected.
fn take_padded(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout_is_stable() {
        assert_eq!(FRAME_LEN, 537);
        let mut msg = Message::new(MessageType::Register, 42);
        msg.pod_name = "trainer-0".into();
        msg.pod_namespace = "ml".into();
        let buf = msg.encode();
        assert_eq!(buf[0], 1);
        // Labels are NUL-terminated in place.
        assert_eq!(&buf[NAME_OFF..NAME_OFF + 10], b"trainer-0\0");
        assert_eq!(Message::decode(&buf).unwrap(), msg);
    }

    #[test]
    fn oversized_labels_are_truncated() {
        let mut msg = Message::new(MessageType::Register, 0);
        msg.pod_name = "x".repeat(LABEL_LEN + 40);
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.pod_name.len(), LABEL_LEN - 1);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut buf = [0u8; FRAME_LEN];
        buf[0] = 99;
        assert_eq!(Message::decode(&buf), Err(WireError::UnknownType(99)));
    }

    #[test]
    fn short_frame_is_rejected() {
        assert_eq!(
            Message::decode(&[1u8; 12]),
            Err(WireError::BadLength(12))
        );
    }

    #[test]
    fn client_id_round_trips_through_hex() {
        let mut msg = Message::new(MessageType::SchedOn, 0);
        msg.set_client_id(0xdead_beef_0042_1337);
        assert_eq!(msg.data.len(), 16);
        assert_eq!(msg.client_id().unwrap(), 0xdead_beef_0042_1337);
    }

    #[test]
    fn quantum_rejects_garbage_and_non_positive() {
        let mut msg = Message::new(MessageType::SetTq, 0);
        for bad in ["", "0", "-5", "abc", "12s"] {
            msg.data = bad.into();
            assert!(msg.quantum().is_err(), "{bad:?} should be rejected");
        }
        msg.set_quantum(30);
        assert_eq!(msg.quantum().unwrap(), 30);
    }
}
