//! Log-sized error text. Provider errors echo whole response bodies and revert payloads, and
//! those end up in round payloads and refusal reasons.

const MAX_HEX_CHARS: usize = 66;

/// Collapses whitespace, drops echoed bodies and backtraces, elides long hex blobs and caps the
/// result at `max_len` bytes on a char boundary.
pub fn compact_error_message(message: &str, max_len: usize) -> String {
    let mut raw = message;
    for marker in ["Stack backtrace:", " text: ", " body: "] {
        if let Some((prefix, _)) = raw.split_once(marker) {
            raw = prefix;
        }
    }

    let mut compact = String::with_capacity(raw.len().min(max_len.saturating_add(16)));
    for word in raw.split_whitespace() {
        if !compact.is_empty() {
            compact.push(' ');
        }
        compact.push_str(&elide_hex(word));
        if compact.len() > max_len {
            break;
        }
    }
    if compact.len() <= max_len {
        return compact;
    }
    let mut cut = max_len;
    while !compact.is_char_boundary(cut) {
        cut -= 1;
    }
    compact.truncate(cut);
    compact.push_str("...(truncated)");
    compact
}

fn elide_hex(word: &str) -> std::borrow::Cow<'_, str> {
    let Some(start) = word.find("0x") else {
        return word.into();
    };
    let digits = word[start + 2..]
        .chars()
        .take_while(|c| c.is_ascii_hexdigit())
        .count();
    if digits + 2 <= MAX_HEX_CHARS {
        return word.into();
    }
    let end = start + 2 + digits;
    format!("{}0x<{} bytes>{}", &word[..start], digits / 2, &word[end..]).into()
}
