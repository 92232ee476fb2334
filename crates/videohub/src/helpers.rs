// Nom helpers shared by the block parser.

use nom::{
    branch::alt,
    bytes::streaming::{tag, take_while1},
    IResult,
};

fn not_line_break(c: u8) -> bool {
    c != b'\r' && c != b'\n'
}

/// Match one line break: CRLF, LF, or a bare CR. Clients disagree on
/// endings; all three are normalized to "one break" here.
// (Streaming: a trailing CR waits for more input, it may be half a CRLF.)
pub fn line_break(i: &[u8]) -> IResult<&[u8], &[u8]> {
    alt((tag(&b"\r\n"[..]), tag(&b"\n"[..]), tag(&b"\r"[..])))(i)
}

/// Take a non-empty line up to the next break, not consuming the break.
// (Streaming)
pub fn line_text(i: &[u8]) -> IResult<&[u8], &[u8]> {
    take_while1(not_line_break)(i)
}

/// Split a body line into a leading decimal index and the remainder after
/// the first whitespace run. The remainder may be empty.
pub fn split_index(line: &[u8]) -> Option<(u16, &[u8])> {
    let digits = line.iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    let index: u16 = std::str::from_utf8(&line[..digits]).ok()?.parse().ok()?;
    let rest = &line[digits..];
    if rest.is_empty() {
        return Some((index, rest));
    }
    let spaces = rest
        .iter()
        .take_while(|b| **b == b' ' || **b == b'\t')
        .count();
    if spaces == 0 {
        // index must be delimited by whitespace or end of line
        return None;
    }
    Some((index, &rest[spaces..]))
}

/// Split a `Key: Value` line. The value is trimmed.
pub fn split_kv(line: &[u8]) -> Option<(&[u8], &[u8])> {
    let colon = line.iter().position(|b| *b == b':')?;
    let key = line[..colon].trim_ascii();
    let value = line[colon + 1..].trim_ascii();
    Some((key, value))
}
