//! Transport whitespace codec.
//!
//! Some proxies treat a body chunk made only of whitespace as a heartbeat and drop
//! it, and the frame layer uses raw `\n` as a delimiter. Every whitespace character
//! of streamed text is therefore replaced by a token before it is written and
//! restored on the client.

const TOKEN_PREFIX: &str = "[WS:";

/// Token table. Multi-character sequences come first so `\r\n` is never split.
const TOKENS: &[(&str, &str)] = &[
    ("\r\n", "[WS:CRLF]"),
    ("\r", "[WS:CR]"),
    ("\n", "[WS:NEWLINE]"),
    ("\t", "[WS:TAB]"),
    ("\u{a0}", "[WS:NBSP]"),
    (" ", "[WS:SPACE]"),
    // Every literal `[` is escaped, so text split across deltas can never
    // join into a token on the wire.
    ("[", "[WS:LBRACKET]"),
];

/// Longest token, used by the client decoder to know how far a partial token can reach.
pub const MAX_TOKEN_LEN: usize = 13;

pub fn encode(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 4);
    let mut rest = text;

    while let Some(ch) = rest.chars().next() {
        let consumed = match ch {
            '\r' if rest.starts_with("\r\n") => {
                out.push_str("[WS:CRLF]");
                2
            }
            '\r' => {
                out.push_str("[WS:CR]");
                1
            }
            '\n' => {
                out.push_str("[WS:NEWLINE]");
                1
            }
            '\t' => {
                out.push_str("[WS:TAB]");
                1
            }
            '\u{a0}' => {
                out.push_str("[WS:NBSP]");
                ch.len_utf8()
            }
            ' ' => {
                out.push_str("[WS:SPACE]");
                1
            }
            '[' => {
                out.push_str("[WS:LBRACKET]");
                1
            }
            other => {
                out.push(other);
                other.len_utf8()
            }
        };
        rest = &rest[consumed..];
    }

    out
}

pub fn decode(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(idx) = rest.find(TOKEN_PREFIX) {
        out.push_str(&rest[..idx]);
        let candidate = &rest[idx..];
        match TOKENS
            .iter()
            .find(|(_, token)| candidate.starts_with(token))
        {
            Some((raw, token)) => {
                out.push_str(raw);
                rest = &candidate[token.len()..];
            }
            None => {
                // Unknown token: keep it verbatim.
                out.push_str(TOKEN_PREFIX);
                rest = &candidate[TOKEN_PREFIX.len()..];
            }
        }
    }
    out.push_str(rest);

    out
}

/// Byte offset of a trailing partial token, if `text` ends with something that
/// could still grow into one once more bytes arrive.
pub fn partial_token_start(text: &str) -> Option<usize> {
    let start = text.rfind('[')?;
    let tail = &text[start..];
    if tail.contains(']') || tail.len() >= MAX_TOKEN_LEN {
        return None;
    }
    let could_be_token = TOKENS.iter().any(|(_, token)| token.starts_with(tail));
    if could_be_token {
        Some(start)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_edge_cases() {
        let samples = [
            "",
            "   ",
            "\t\t",
            "\n\n\n",
            "a\r\nb\nc\rd",
            "\r\n\n\r",
            "price:\u{a0}10\u{a0}€",
            "mixed \t tabs\r\n and spaces ",
            "literal [WS:SPACE] token and [WS: half",
            "[[WS:[WS:",
            "emoji 🙂 and ünïcödé",
        ];
        for sample in samples {
            assert_eq!(decode(&encode(sample)), sample, "round trip of {:?}", sample);
        }
    }

    #[test]
    fn test_encoded_text_has_no_whitespace() {
        let encoded = encode("one two\nthree\tfour\r\nfive");
        assert!(!encoded.chars().any(char::is_whitespace));
        assert_eq!(
            encoded,
            "one[WS:SPACE]two[WS:NEWLINE]three[WS:TAB]four[WS:CRLF]five"
        );
    }

    #[test]
    fn test_crlf_is_encoded_before_lone_newline() {
        assert_eq!(encode("\r\n"), "[WS:CRLF]");
        assert_eq!(encode("\n\r"), "[WS:NEWLINE][WS:CR]");
    }

    #[test]
    fn test_brackets_are_escaped() {
        assert_eq!(encode("[link](url)"), "[WS:LBRACKET]link](url)");
        assert_eq!(decode("[WS:LBRACKET]link](url)"), "[link](url)");
        assert_eq!(encode("[KEEP_ALIVE]"), "[WS:LBRACKET]KEEP_ALIVE]");
    }

    #[test]
    fn test_token_split_across_deltas_stays_literal() {
        let wire = format!("{}{}", encode("see [WS"), encode(":SPACE] here"));
        assert_eq!(decode(&wire), "see [WS:SPACE] here");
    }

    #[test]
    fn test_unknown_token_is_kept_verbatim() {
        assert_eq!(decode("[WS:BOGUS]x"), "[WS:BOGUS]x");
    }

    #[test]
    fn test_partial_token_detection() {
        assert_eq!(partial_token_start("hello[WS:SP"), Some(5));
        assert_eq!(partial_token_start("hello["), Some(5));
        assert_eq!(partial_token_start("hello[WS:SPACE]"), None);
        assert_eq!(partial_token_start("see [link"), None);
        assert_eq!(partial_token_start("plain"), None);
    }

    #[test]
    fn test_max_token_len_covers_every_token() {
        for (_, token) in TOKENS {
            assert!(token.len() <= MAX_TOKEN_LEN);
        }
    }
}
