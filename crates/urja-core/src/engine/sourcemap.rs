//! Line-level source maps.
//!
//! The built-in engine never moves code within a line, so every generated
//! line maps column 0 to column 0 of one source line.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

const BASE64_CHARS: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

fn encode_vlq(out: &mut String, value: i64) {
    let mut vlq = if value < 0 {
        ((-value) << 1) | 1
    } else {
        value << 1
    };
    loop {
        let mut digit = vlq & 0b1_1111;
        vlq >>= 5;
        if vlq > 0 {
            digit |= 0b10_0000;
        }
        // digit is < 64 by construction
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        out.push(char::from(BASE64_CHARS[digit as usize]));
        if vlq == 0 {
            break;
        }
    }
}

/// Encode `mappings` where `lines[g]` is the source line of generated line `g`.
pub(crate) fn encode_line_mappings(lines: &[usize]) -> String {
    let mut out = String::new();
    let mut prev_src_line: i64 = 0;
    for (i, &src_line) in lines.iter().enumerate() {
        if i > 0 {
            out.push(';');
        }
        #[allow(clippy::cast_possible_wrap)]
        let src_line = src_line as i64;
        encode_vlq(&mut out, 0);
        encode_vlq(&mut out, 0);
        encode_vlq(&mut out, src_line - prev_src_line);
        encode_vlq(&mut out, 0);
        prev_src_line = src_line;
    }
    out
}

/// Build a version 3 source map JSON document for a single source.
pub(crate) fn line_map_json(source_name: &str, source: &str, lines: &[usize]) -> String {
    serde_json::json!({
        "version": 3,
        "sources": [source_name],
        "sourcesContent": [source],
        "names": [],
        "mappings": encode_line_mappings(lines),
    })
    .to_string()
}

/// `sourceMappingURL` comment carrying the map as a data URL.
pub(crate) fn inline_comment(map_json: &str) -> String {
    format!(
        "//# sourceMappingURL=data:application/json;base64,{}",
        STANDARD.encode(map_json)
    )
}

/// `sourceMappingURL` comment pointing at a sibling file.
pub(crate) fn external_comment(map_file: &str) -> String {
    format!("//# sourceMappingURL={map_file}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_mappings() {
        assert_eq!(encode_line_mappings(&[0, 1, 2]), "AAAA;AACA;AACA");
    }

    #[test]
    fn test_skipped_lines_use_larger_deltas() {
        // 0 -> line 0, 1 -> line 16: delta 16 needs a continuation digit
        assert_eq!(encode_line_mappings(&[0, 16]), "AAAA;AAgBA");
    }

    #[test]
    fn test_inline_comment_round_trips() {
        let json = line_map_json("a.js", "x\n", &[0]);
        let comment = inline_comment(&json);
        let b64 = comment
            .strip_prefix("//# sourceMappingURL=data:application/json;base64,")
            .unwrap();
        let decoded = String::from_utf8(STANDARD.decode(b64).unwrap()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&decoded).unwrap();
        assert_eq!(value["version"], 3);
        assert_eq!(value["sources"][0], "a.js");
        assert_eq!(value["mappings"], "AAAA");
    }
}
