// codec.rs - Tokio codec for outbound SIP datagrams

use crate::{Message, SipError, MAX_MESSAGE_LENGTH};
use bytes::{BufMut, BytesMut};
use tokio_util::codec::Encoder;

/// Encodes a [`Message`] for the wire. `Content-Length` is recomputed from
/// the body on every encode and written in place of any stale value; the
/// caller's message is left untouched.
pub struct SipCodec {
    /// Maximum allowed message size
    max_message_size: usize,
}

impl Default for SipCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl SipCodec {
    pub fn new() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_LENGTH,
        }
    }

    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

impl<'a> Encoder<&'a Message> for SipCodec {
    type Error = SipError;

    fn encode(&mut self, item: &'a Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut message = item.clone();
        message.set_header("Content-Length", message.body.len().to_string(), true);

        let text = message.serialize();
        if text.len() > self.max_message_size {
            return Err(SipError::MessageTooLarge(text.len(), self.max_message_size));
        }

        dst.reserve(text.len());
        dst.put_slice(text.as_bytes());
        Ok(())
    }
}
