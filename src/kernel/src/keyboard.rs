//! PS/2 keyboard input.
//!
//! The keyboard IRQ handler only queues raw scancodes; decoding happens in a
//! kernel thread so the interrupt path stays short.

use crossbeam_queue::ArrayQueue;
use pc_keyboard::{layouts, DecodedKey, HandleControl, Keyboard, ScancodeSet1};
use spin::Once;

/// Scancodes waiting to be decoded.
pub static SCANCODE_QUEUE: Once<ArrayQueue<u8>> = Once::new();

const QUEUE_CAPACITY: usize = 100;

/// Creates the scancode queue. Must run before the keyboard IRQ is unmasked.
pub fn init() {
    SCANCODE_QUEUE.call_once(|| ArrayQueue::new(QUEUE_CAPACITY));
}

/// Queues a scancode. Called from the keyboard interrupt handler.
///
/// Returns `false` if the scancode was dropped.
pub fn add_scancode(scancode: u8) -> bool {
    match SCANCODE_QUEUE.get() {
        Some(queue) => queue.push(scancode).is_ok(),
        None => false,
    }
}

/// Takes the oldest queued scancode.
pub fn pop_scancode() -> Option<u8> {
    SCANCODE_QUEUE.get()?.pop()
}

/// Turns a scancode stream into key presses.
pub struct KeyDecoder {
    keyboard: Keyboard<layouts::Us104Key, ScancodeSet1>,
}

impl KeyDecoder {
    /// Creates a decoder for a US layout in scancode set 1.
    pub fn new() -> Self {
        Self {
            keyboard: Keyboard::new(
                ScancodeSet1::new(),
                layouts::Us104Key,
                HandleControl::Ignore,
            ),
        }
    }

    /// Feeds one scancode and returns the key it completes, if any.
    pub fn decode(&mut self, scancode: u8) -> Option<DecodedKey> {
        match self.keyboard.add_byte(scancode) {
            Ok(Some(event)) => self.keyboard.process_keyevent(event),
            _ => None,
        }
    }
}

impl Default for KeyDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_press_and_release() {
        let mut decoder = KeyDecoder::new();
        // 'a' make code, then break code
        assert_eq!(decoder.decode(0x1E), Some(DecodedKey::Unicode('a')));
        assert_eq!(decoder.decode(0x9E), None);
    }

    #[test]
    fn test_queue_round_trip() {
        init();
        assert!(add_scancode(0x1E));
        assert_eq!(pop_scancode(), Some(0x1E));
        assert_eq!(pop_scancode(), None);
    }
}
