/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Minimal wire layer for the session core.
//!
//! The session engine does not interpret business payloads; it only needs
//! header-field access (MsgType, MsgSeqNum, PossDupFlag, SendingTime, the
//! CompIDs) plus enough structure to re-serialize a stored message with
//! rewritten dup/timestamp fields on resend. This module provides:
//! - [`WireMessage`]: Owned, parsed view of one framed tag=value message
//! - [`MessageBuilder`]: Incremental construction with automatic
//!   BeginString/BodyLength/Checksum handling
//! - [`rewrite_as_resend`]: The replay rewrite (PossDupFlag=Y,
//!   OrigSendingTime from the original SendingTime, everything else
//!   byte-identical)
//!
//! Full message framing and business-field codecs are external collaborators.

use crate::error::WireError;
use crate::types::{MsgKind, SeqNum, SessionKey};
use bytes::{BufMut, Bytes, BytesMut};
use memchr::memchr;
use smallvec::SmallVec;
use std::ops::Range;

/// SOH (Start of Header) delimiter used in FIX messages.
pub const SOH: u8 = 0x01;

/// Tag numbers the session layer cares about.
pub mod tags {
    /// BeginSeqNo (7) - first sequence of a resend range.
    pub const BEGIN_SEQ_NO: u32 = 7;
    /// BeginString (8).
    pub const BEGIN_STRING: u32 = 8;
    /// BodyLength (9).
    pub const BODY_LENGTH: u32 = 9;
    /// CheckSum (10).
    pub const CHECK_SUM: u32 = 10;
    /// EndSeqNo (16) - last sequence of a resend range, 0 = infinity.
    pub const END_SEQ_NO: u32 = 16;
    /// MsgSeqNum (34).
    pub const MSG_SEQ_NUM: u32 = 34;
    /// MsgType (35).
    pub const MSG_TYPE: u32 = 35;
    /// NewSeqNo (36) - target sequence of a SequenceReset.
    pub const NEW_SEQ_NO: u32 = 36;
    /// PossDupFlag (43).
    pub const POSS_DUP_FLAG: u32 = 43;
    /// RefSeqNum (45) - sequence referenced by a Reject.
    pub const REF_SEQ_NUM: u32 = 45;
    /// SenderCompID (49).
    pub const SENDER_COMP_ID: u32 = 49;
    /// SenderSubID (50).
    pub const SENDER_SUB_ID: u32 = 50;
    /// SendingTime (52).
    pub const SENDING_TIME: u32 = 52;
    /// TargetCompID (56).
    pub const TARGET_COMP_ID: u32 = 56;
    /// TargetSubID (57).
    pub const TARGET_SUB_ID: u32 = 57;
    /// Text (58).
    pub const TEXT: u32 = 58;
    /// HeartBtInt (108).
    pub const HEART_BT_INT: u32 = 108;
    /// TestReqID (112).
    pub const TEST_REQ_ID: u32 = 112;
    /// OrigSendingTime (122).
    pub const ORIG_SENDING_TIME: u32 = 122;
    /// GapFillFlag (123).
    pub const GAP_FILL_FLAG: u32 = 123;
    /// ResetSeqNumFlag (141).
    pub const RESET_SEQ_NUM_FLAG: u32 = 141;
}

/// Calculates the FIX checksum: sum of all bytes modulo 256.
#[inline]
#[must_use]
pub fn calculate_checksum(data: &[u8]) -> u8 {
    let sum: u32 = data.iter().map(|&b| b as u32).sum();
    (sum % 256) as u8
}

/// Formats a checksum value as a 3-digit zero-padded byte string.
#[inline]
#[must_use]
pub fn format_checksum(checksum: u8) -> [u8; 3] {
    [
        b'0' + (checksum / 100),
        b'0' + ((checksum / 10) % 10),
        b'0' + (checksum % 10),
    ]
}

/// Parses a 3-digit checksum string.
///
/// # Returns
/// `Some(checksum)` if valid, `None` otherwise.
#[inline]
#[must_use]
pub fn parse_checksum(bytes: &[u8]) -> Option<u8> {
    if bytes.len() != 3 {
        return None;
    }
    let d0 = bytes[0].checked_sub(b'0')?;
    let d1 = bytes[1].checked_sub(b'0')?;
    let d2 = bytes[2].checked_sub(b'0')?;
    if d0 > 9 || d1 > 9 || d2 > 9 {
        return None;
    }
    Some(d0 * 100 + d1 * 10 + d2)
}

/// Owned, parsed view of one framed FIX message.
///
/// Fields are stored as `(tag, value range)` pairs into the original buffer,
/// in wire order. The buffer is kept verbatim so a stored message replays
/// bit-identically.
#[derive(Debug, Clone)]
pub struct WireMessage {
    /// The complete message buffer.
    buffer: Bytes,
    /// The parsed message kind (tag 35).
    kind: MsgKind,
    /// All fields in wire order, including 8, 9, and 10.
    fields: SmallVec<[(u32, Range<usize>); 24]>,
}

impl WireMessage {
    /// Parses a complete framed message.
    ///
    /// The buffer must contain exactly one message: BeginString first,
    /// BodyLength second, MsgType first in the body, CheckSum last.
    ///
    /// # Arguments
    /// * `buffer` - The framed message bytes
    /// * `validate_checksum` - Whether to verify the declared checksum
    ///
    /// # Errors
    /// Returns `WireError` if the message is malformed.
    pub fn parse(buffer: Bytes, validate_checksum: bool) -> Result<Self, WireError> {
        let mut fields: SmallVec<[(u32, Range<usize>); 24]> = SmallVec::new();
        let mut pos = 0usize;
        let mut checksum_start = None;

        while pos < buffer.len() {
            let eq = memchr(b'=', &buffer[pos..]).ok_or(WireError::Truncated)? + pos;
            let tag: u32 = std::str::from_utf8(&buffer[pos..eq])
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| WireError::InvalidField {
                    tag: 0,
                    reason: "non-numeric tag".to_string(),
                })?;
            let soh = memchr(SOH, &buffer[eq + 1..]).ok_or(WireError::Truncated)? + eq + 1;

            if tag == tags::CHECK_SUM {
                checksum_start = Some(pos);
            }
            fields.push((tag, eq + 1..soh));
            pos = soh + 1;

            if tag == tags::CHECK_SUM {
                break;
            }
        }

        if pos != buffer.len() {
            return Err(WireError::InvalidField {
                tag: tags::CHECK_SUM,
                reason: "trailing data after checksum".to_string(),
            });
        }

        match fields.first() {
            Some((tag, _)) if *tag == tags::BEGIN_STRING => {}
            _ => return Err(WireError::InvalidBeginString),
        }
        match fields.get(1) {
            Some((tag, _)) if *tag == tags::BODY_LENGTH => {}
            _ => return Err(WireError::MissingBodyLength),
        }
        let kind = match fields.get(2) {
            Some((tag, range)) if *tag == tags::MSG_TYPE => MsgKind::from_wire(
                std::str::from_utf8(&buffer[range.clone()]).map_err(|_| {
                    WireError::InvalidField {
                        tag: tags::MSG_TYPE,
                        reason: "invalid utf-8".to_string(),
                    }
                })?,
            ),
            _ => return Err(WireError::MissingMsgType),
        };
        let checksum_start = checksum_start.ok_or(WireError::Truncated)?;

        if validate_checksum {
            let (_, range) = fields.last().ok_or(WireError::Truncated)?;
            let declared =
                parse_checksum(&buffer[range.clone()]).ok_or_else(|| WireError::InvalidField {
                    tag: tags::CHECK_SUM,
                    reason: "not a 3-digit value".to_string(),
                })?;
            let calculated = calculate_checksum(&buffer[..checksum_start]);
            if calculated != declared {
                return Err(WireError::ChecksumMismatch {
                    calculated,
                    declared,
                });
            }
        }

        Ok(Self {
            buffer,
            kind,
            fields,
        })
    }

    /// Returns the message kind.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> &MsgKind {
        &self.kind
    }

    /// Returns the complete message buffer.
    #[inline]
    #[must_use]
    pub fn bytes(&self) -> &Bytes {
        &self.buffer
    }

    /// Returns an iterator over all fields as `(tag, value)` pairs.
    pub fn fields(&self) -> impl Iterator<Item = (u32, &[u8])> {
        self.fields
            .iter()
            .map(|(tag, range)| (*tag, &self.buffer[range.clone()]))
    }

    /// Gets the first field with the given tag.
    #[must_use]
    pub fn field(&self, tag: u32) -> Option<&[u8]> {
        self.fields
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, range)| &self.buffer[range.clone()])
    }

    /// Gets a field value as a string.
    #[must_use]
    pub fn field_str(&self, tag: u32) -> Option<&str> {
        self.field(tag).and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Gets a field parsed as an unsigned integer.
    ///
    /// # Errors
    /// Returns `WireError` if the field is absent or not numeric.
    pub fn field_u64(&self, tag: u32) -> Result<u64, WireError> {
        let value = self.field(tag).ok_or(WireError::MissingField { tag })?;
        std::str::from_utf8(value)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| WireError::InvalidField {
                tag,
                reason: "not an unsigned integer".to_string(),
            })
    }

    /// Returns the BeginString value.
    ///
    /// # Errors
    /// Returns `WireError` if the field holds invalid UTF-8.
    pub fn begin_string(&self) -> Result<&str, WireError> {
        self.field_str(tags::BEGIN_STRING)
            .ok_or(WireError::MissingField {
                tag: tags::BEGIN_STRING,
            })
    }

    /// Returns the message sequence number (tag 34).
    ///
    /// # Errors
    /// Returns `WireError` if the field is absent or invalid.
    pub fn seq(&self) -> Result<SeqNum, WireError> {
        self.field_u64(tags::MSG_SEQ_NUM).map(SeqNum::new)
    }

    /// Returns true if PossDupFlag (tag 43) is set.
    #[must_use]
    pub fn poss_dup(&self) -> bool {
        self.field(tags::POSS_DUP_FLAG) == Some(b"Y")
    }

    /// Returns true if GapFillFlag (tag 123) is set.
    #[must_use]
    pub fn gap_fill(&self) -> bool {
        self.field(tags::GAP_FILL_FLAG) == Some(b"Y")
    }

    /// Returns true if ResetSeqNumFlag (tag 141) is set.
    #[must_use]
    pub fn reset_seq_num(&self) -> bool {
        self.field(tags::RESET_SEQ_NUM_FLAG) == Some(b"Y")
    }

    /// Returns the SenderCompID value, if present.
    #[must_use]
    pub fn sender_comp_id(&self) -> Option<&str> {
        self.field_str(tags::SENDER_COMP_ID)
    }

    /// Returns the TargetCompID value, if present.
    #[must_use]
    pub fn target_comp_id(&self) -> Option<&str> {
        self.field_str(tags::TARGET_COMP_ID)
    }

    /// Returns the TestReqID value, if present.
    #[must_use]
    pub fn test_req_id(&self) -> Option<&str> {
        self.field_str(tags::TEST_REQ_ID)
    }

    /// Returns the Text value, if present.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        self.field_str(tags::TEXT)
    }
}

/// Incremental FIX message builder.
///
/// Body fields are appended in call order; `finish` prepends BeginString and
/// BodyLength and appends the checksum trailer.
#[derive(Debug)]
pub struct MessageBuilder {
    /// The BeginString value (e.g., "FIX.4.4").
    begin_string: String,
    /// Buffer for the message body (between BodyLength and Checksum).
    body: BytesMut,
}

impl MessageBuilder {
    /// Creates a new builder for the given FIX version.
    #[must_use]
    pub fn new(begin_string: impl Into<String>) -> Self {
        Self {
            begin_string: begin_string.into(),
            body: BytesMut::with_capacity(256),
        }
    }

    /// Appends a field with raw bytes.
    #[inline]
    pub fn put_raw(&mut self, tag: u32, value: &[u8]) {
        let mut tag_buf = itoa::Buffer::new();
        self.body.put_slice(tag_buf.format(tag).as_bytes());
        self.body.put_u8(b'=');
        self.body.put_slice(value);
        self.body.put_u8(SOH);
    }

    /// Appends a field with a string value.
    #[inline]
    pub fn put_str(&mut self, tag: u32, value: &str) {
        self.put_raw(tag, value.as_bytes());
    }

    /// Appends a field with an unsigned integer value.
    #[inline]
    pub fn put_u64(&mut self, tag: u32, value: u64) {
        let mut buf = itoa::Buffer::new();
        self.put_raw(tag, buf.format(value).as_bytes());
    }

    /// Appends a field with a boolean value (Y/N).
    #[inline]
    pub fn put_bool(&mut self, tag: u32, value: bool) {
        self.put_raw(tag, if value { b"Y" } else { b"N" });
    }

    /// Finalizes the message: prepends BeginString (8) and BodyLength (9),
    /// appends CheckSum (10), and returns the complete wire bytes.
    #[must_use]
    pub fn finish(self) -> Bytes {
        let mut len_buf = itoa::Buffer::new();
        let len_str = len_buf.format(self.body.len());

        let mut message =
            BytesMut::with_capacity(self.begin_string.len() + len_str.len() + self.body.len() + 16);
        message.put_slice(b"8=");
        message.put_slice(self.begin_string.as_bytes());
        message.put_u8(SOH);
        message.put_slice(b"9=");
        message.put_slice(len_str.as_bytes());
        message.put_u8(SOH);
        message.put_slice(&self.body);

        let checksum = calculate_checksum(&message);
        message.put_slice(b"10=");
        message.put_slice(&format_checksum(checksum));
        message.put_u8(SOH);

        message.freeze()
    }
}

/// Builds a session message with the standard header field order:
/// MsgType (35), MsgSeqNum (34), SenderCompID (49), [SenderSubID (50)],
/// TargetCompID (56), [TargetSubID (57)], SendingTime (52), then the body.
#[must_use]
pub fn build_session_message(
    key: &SessionKey,
    msg_type: &str,
    seq: SeqNum,
    sending_time: &str,
    body: impl FnOnce(&mut MessageBuilder),
) -> Bytes {
    let mut builder = MessageBuilder::new(key.begin_string.clone());
    builder.put_str(tags::MSG_TYPE, msg_type);
    builder.put_u64(tags::MSG_SEQ_NUM, seq.value());
    builder.put_str(tags::SENDER_COMP_ID, key.sender.as_str());
    if let Some(sub) = &key.sender_sub {
        builder.put_str(tags::SENDER_SUB_ID, sub);
    }
    builder.put_str(tags::TARGET_COMP_ID, key.target.as_str());
    if let Some(sub) = &key.target_sub {
        builder.put_str(tags::TARGET_SUB_ID, sub);
    }
    builder.put_str(tags::SENDING_TIME, sending_time);
    body(&mut builder);
    builder.finish()
}

/// Rewrites a stored message for retransmission.
///
/// The result carries PossDupFlag=Y and OrigSendingTime populated from the
/// original SendingTime; every other body field is emitted byte-identical in
/// its original order. BodyLength and CheckSum are recomputed. An existing
/// OrigSendingTime (a stored message that was itself a retransmission) is
/// preserved.
///
/// # Errors
/// Returns `WireError` if the original lacks SendingTime or BeginString.
pub fn rewrite_as_resend(msg: &WireMessage) -> Result<Bytes, WireError> {
    let orig_time = msg
        .field(tags::SENDING_TIME)
        .ok_or(WireError::MissingField {
            tag: tags::SENDING_TIME,
        })?;
    let had_poss_dup = msg.field(tags::POSS_DUP_FLAG).is_some();
    let had_orig_time = msg.field(tags::ORIG_SENDING_TIME).is_some();

    let mut builder = MessageBuilder::new(msg.begin_string()?);
    for (tag, value) in msg.fields() {
        match tag {
            tags::BEGIN_STRING | tags::BODY_LENGTH | tags::CHECK_SUM => {}
            tags::POSS_DUP_FLAG => builder.put_raw(tag, b"Y"),
            _ => {
                builder.put_raw(tag, value);
                if tag == tags::MSG_SEQ_NUM && !had_poss_dup {
                    builder.put_raw(tags::POSS_DUP_FLAG, b"Y");
                }
                if tag == tags::SENDING_TIME && !had_orig_time {
                    builder.put_raw(tags::ORIG_SENDING_TIME, orig_time);
                }
            }
        }
    }
    Ok(builder.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CompId, SessionKey};

    fn test_key() -> SessionKey {
        SessionKey::new(
            "FIX.4.4",
            CompId::new("SENDER").unwrap(),
            CompId::new("TARGET").unwrap(),
        )
    }

    fn sample_app_message(seq: u64) -> Bytes {
        build_session_message(&test_key(), "D", SeqNum::new(seq), "20260127-10:00:00.000", |b| {
            b.put_str(11, "ORDER-1");
            b.put_str(55, "EURUSD");
        })
    }

    #[test]
    fn test_checksum_roundtrip() {
        for value in [0u8, 42, 100, 255] {
            assert_eq!(parse_checksum(&format_checksum(value)), Some(value));
        }
        assert_eq!(parse_checksum(b"ab1"), None);
        assert_eq!(parse_checksum(b"12"), None);
    }

    #[test]
    fn test_build_and_parse_roundtrip() {
        let bytes = sample_app_message(7);
        let msg = WireMessage::parse(bytes, true).unwrap();

        assert_eq!(msg.kind(), &MsgKind::App("D".to_string()));
        assert_eq!(msg.seq().unwrap().value(), 7);
        assert_eq!(msg.begin_string().unwrap(), "FIX.4.4");
        assert_eq!(msg.sender_comp_id(), Some("SENDER"));
        assert_eq!(msg.target_comp_id(), Some("TARGET"));
        assert_eq!(msg.field_str(55), Some("EURUSD"));
        assert!(!msg.poss_dup());
    }

    #[test]
    fn test_parse_header_order_enforced() {
        let mut builder = MessageBuilder::new("FIX.4.4");
        builder.put_u64(tags::MSG_SEQ_NUM, 1);
        let bytes = builder.finish();
        // MsgType is not the first body field.
        let result = WireMessage::parse(bytes, true);
        assert!(matches!(result, Err(WireError::MissingMsgType)));
    }

    #[test]
    fn test_parse_checksum_mismatch() {
        let bytes = sample_app_message(1);
        let mut corrupted = bytes.to_vec();
        // Flip a body byte without updating the trailer.
        let pos = corrupted.len() / 2;
        corrupted[pos] = corrupted[pos].wrapping_add(1);
        let result = WireMessage::parse(Bytes::from(corrupted), true);
        assert!(matches!(result, Err(WireError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_parse_truncated() {
        let bytes = sample_app_message(1);
        let truncated = bytes.slice(..bytes.len() - 6);
        let result = WireMessage::parse(truncated, true);
        assert!(result.is_err());
    }

    #[test]
    fn test_rewrite_as_resend_sets_dup_fields() {
        let original = WireMessage::parse(sample_app_message(9), true).unwrap();
        let resent = WireMessage::parse(rewrite_as_resend(&original).unwrap(), true).unwrap();

        assert!(resent.poss_dup());
        assert_eq!(
            resent.field_str(tags::ORIG_SENDING_TIME),
            original.field_str(tags::SENDING_TIME)
        );
        // Timestamp preserved, not rewritten.
        assert_eq!(
            resent.field_str(tags::SENDING_TIME),
            original.field_str(tags::SENDING_TIME)
        );
        assert_eq!(resent.seq().unwrap(), original.seq().unwrap());
    }

    #[test]
    fn test_rewrite_as_resend_body_identical() {
        let original = WireMessage::parse(sample_app_message(9), true).unwrap();
        let resent = WireMessage::parse(rewrite_as_resend(&original).unwrap(), true).unwrap();

        let strip = |m: &WireMessage| -> Vec<(u32, Vec<u8>)> {
            m.fields()
                .filter(|(tag, _)| {
                    !matches!(
                        *tag,
                        tags::BEGIN_STRING
                            | tags::BODY_LENGTH
                            | tags::CHECK_SUM
                            | tags::POSS_DUP_FLAG
                            | tags::ORIG_SENDING_TIME
                    )
                })
                .map(|(tag, value)| (tag, value.to_vec()))
                .collect()
        };
        assert_eq!(strip(&original), strip(&resent));
    }

    #[test]
    fn test_rewrite_preserves_existing_orig_sending_time() {
        let original = WireMessage::parse(sample_app_message(3), true).unwrap();
        let first = WireMessage::parse(rewrite_as_resend(&original).unwrap(), true).unwrap();
        let second = WireMessage::parse(rewrite_as_resend(&first).unwrap(), true).unwrap();

        assert_eq!(
            second.field_str(tags::ORIG_SENDING_TIME),
            original.field_str(tags::SENDING_TIME)
        );
        // No duplicated OrigSendingTime field.
        let orig_count = second
            .fields()
            .filter(|(tag, _)| *tag == tags::ORIG_SENDING_TIME)
            .count();
        assert_eq!(orig_count, 1);
    }

    #[test]
    fn test_field_u64_errors() {
        let msg = WireMessage::parse(sample_app_message(1), true).unwrap();
        assert!(matches!(
            msg.field_u64(9999),
            Err(WireError::MissingField { tag: 9999 })
        ));
        assert!(matches!(
            msg.field_u64(55),
            Err(WireError::InvalidField { tag: 55, .. })
        ));
    }

    #[test]
    fn test_sub_ids_in_header() {
        let key = test_key()
            .with_sender_sub("DESK-1")
            .with_target_sub("DESK-2");
        let bytes =
            build_session_message(&key, "0", SeqNum::new(1), "20260127-10:00:00.000", |_| {});
        let msg = WireMessage::parse(bytes, true).unwrap();
        assert_eq!(msg.field_str(tags::SENDER_SUB_ID), Some("DESK-1"));
        assert_eq!(msg.field_str(tags::TARGET_SUB_ID), Some("DESK-2"));
    }
}
