//! The envelope the device frames replies in.
//!
//! A reply is a `#START\r\n` (or `#ERROR\r\n`) header line, any number of
//! `\r\n`-terminated body lines, and a `#STOP\r\n` trailer. The broker
//! treats everything as opaque bytes apart from the trailer, which tells
//! it the wire is free for the next command.

/// Tail sequence terminating every reply from the device.
pub const END_OF_MESSAGE: &[u8] = b"\r\n#STOP\r\n";

/// The complete envelope the broker synthesizes when a command fails
/// locally, i.e. on response timeout or a serial port error.
pub const ERROR_REPLY: &[u8] = b"#ERROR\r\n#STOP\r\n";

/// Accumulates reply bytes and recognizes the end of a message.
///
/// The buffer holds the whole reply so far, so a trailer split across
/// reads is still found.
#[derive(Debug, Default)]
pub struct ResponseAccumulator {
    buffer: Vec<u8>,
}

impl ResponseAccumulator {
    /// Append bytes read from the device.
    ///
    /// Returns true when the accumulated reply now ends with
    /// [`END_OF_MESSAGE`].
    pub fn push(&mut self, bytes: &[u8]) -> bool {
        self.buffer.extend_from_slice(bytes);
        self.buffer.ends_with(END_OF_MESSAGE)
    }

    /// Forget the accumulated reply.
    ///
    /// Called when a message completes and when the active command is
    /// aborted by a reset.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_reply_in_one_read() {
        let mut accumulator = ResponseAccumulator::default();

        assert!(accumulator.push(b"#START\r\nok\r\n#STOP\r\n"));
    }

    #[test]
    fn trailer_split_across_reads() {
        let mut accumulator = ResponseAccumulator::default();

        assert!(!accumulator.push(b"#START\r\nok"));
        assert!(!accumulator.push(b"\r\n#STO"));
        assert!(accumulator.push(b"P\r\n"));
    }

    #[test]
    fn synthesized_error_reply_is_a_complete_envelope() {
        let mut accumulator = ResponseAccumulator::default();

        assert!(accumulator.push(ERROR_REPLY));
    }

    #[test]
    fn short_reply_does_not_underflow() {
        let mut accumulator = ResponseAccumulator::default();

        // Fewer bytes than the trailer is long.
        assert!(!accumulator.push(b"#STOP"));
    }

    #[test]
    fn clear_forgets_partial_reply() {
        let mut accumulator = ResponseAccumulator::default();

        assert!(!accumulator.push(b"#START\r\nok\r\n#STO"));
        accumulator.clear();

        // The dangling "P\r\n" of the previous reply must not complete
        // anything on its own.
        assert!(!accumulator.push(b"P\r\n"));
    }
}
