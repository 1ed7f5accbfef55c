//! IRC formatting removal for message bodies.
//!
//! Colour codes are `\x03` followed by an optional foreground of one or two
//! digits and, only when a foreground is present, an optional `,` plus a
//! one- or two-digit background. Bold, underline, italic, strikethrough and
//! reset are single control characters.

use std::iter::Peekable;
use std::str::Chars;

const COLOR: char = '\x03';
const BOLD: char = '\x02';
const UNDERLINE: char = '\x1F';
const ITALIC: char = '\x1D';
const STRIKETHROUGH: char = '\x1E';
const RESET: char = '\x0F';

/// Remove colour and formatting control sequences, keeping everything else.
pub fn strip_formatting(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            COLOR => {
                if take_digits(&mut chars) > 0 {
                    let mut lookahead = chars.clone();
                    if lookahead.next() == Some(',')
                        && lookahead.peek().is_some_and(char::is_ascii_digit)
                    {
                        chars.next();
                        take_digits(&mut chars);
                    }
                }
            }
            BOLD | UNDERLINE | ITALIC | STRIKETHROUGH | RESET => {}
            _ => out.push(c),
        }
    }
    out
}

/// Strip formatting and trim surrounding whitespace.
///
/// Total and idempotent: every control character is consumed in one pass,
/// so a second pass has nothing left to remove.
pub fn clean_message(text: &str) -> String {
    strip_formatting(text).trim().to_owned()
}

/// Consume up to two ASCII digits, returning how many were taken.
fn take_digits(chars: &mut Peekable<Chars<'_>>) -> usize {
    let mut taken = 0;
    while taken < 2 && chars.peek().is_some_and(char::is_ascii_digit) {
        chars.next();
        taken += 1;
    }
    taken
}
