//! Outbound half of the duplex connection, as seen by the pipeline.
//!
//! The WebSocket actor implements this over its actix address; tests use a
//! recording fake. Sends are fire-and-forget: a closed channel returns
//! `ChannelClosed` and callers stop sending.

use crate::error::VoiceResult;
use crate::protocol::ServerMessage;

pub trait OutboundChannel: Send + Sync {
    fn is_open(&self) -> bool;

    fn send_text(&self, text: String) -> VoiceResult<()>;

    fn send_binary(&self, frame: Vec<u8>) -> VoiceResult<()>;

    /// Ask the transport to close. Idempotent.
    fn close(&self);

    fn send_message(&self, message: &ServerMessage) -> VoiceResult<()> {
        self.send_text(message.to_json())
    }
}
