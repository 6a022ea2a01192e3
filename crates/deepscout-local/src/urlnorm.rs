use deepscout_core::SearchHit;

/// RFC 3986 reserved characters whose percent-encodings must survive decoding:
/// turning `%2F` into `/` (and friends) changes what URL the string denotes.
/// `%25` and `%20` are kept too so decoding stays reversible and stable.
const RESERVED: &[&str] = &[
    "%2f", "%3f", "%23", "%26", "%3d", "%40", "%3a", "%5b", "%5d", "%21", "%24", "%27", "%28",
    "%29", "%2a", "%2b", "%2c", "%3b", "%25", "%20",
];

fn is_reserved(seq: &[char]) -> bool {
    let lower: String = seq.iter().collect::<String>().to_lowercase();
    RESERVED.contains(&lower.as_str())
}

fn is_hex(c: char) -> bool {
    c.is_ascii_hexdigit()
}

fn hex_value(c: char) -> u8 {
    c.to_digit(16).unwrap_or(0) as u8
}

/// Percent-decode a URL-ish string without altering its semantics: reserved
/// sequences pass through untouched, while runs of consecutive safe sequences
/// are decoded as one unit (so multi-byte UTF-8 encodings survive).
pub fn safe_unquote(url: &str) -> String {
    if url.is_empty() {
        return String::new();
    }

    let chars: Vec<char> = url.chars().collect();
    let n = chars.len();
    let mut out = String::with_capacity(url.len());
    let mut i = 0;

    while i < n {
        if chars[i] == '%' && i + 2 < n && is_hex(chars[i + 1]) && is_hex(chars[i + 2]) {
            if is_reserved(&chars[i..i + 3]) {
                out.extend(&chars[i..i + 3]);
                i += 3;
                continue;
            }

            // Collect the run of consecutive safe sequences starting here.
            let mut j = i + 3;
            while j + 2 < n && chars[j] == '%' && is_hex(chars[j + 1]) && is_hex(chars[j + 2]) {
                if is_reserved(&chars[j..j + 3]) {
                    break;
                }
                j += 3;
            }

            let mut bytes = Vec::with_capacity((j - i) / 3);
            let mut k = i;
            while k < j {
                bytes.push(hex_value(chars[k + 1]) * 16 + hex_value(chars[k + 2]));
                k += 3;
            }
            out.push_str(&String::from_utf8_lossy(&bytes));
            i = j;
            continue;
        }

        out.push(chars[i]);
        i += 1;
    }

    out
}

/// Decode over-encoded URL values in search hits. Only strings that look like
/// percent-encoded HTTP URLs are touched.
pub fn decode_hit_urls(hits: &mut [SearchHit]) {
    for hit in hits {
        for field in [&mut hit.title, &mut hit.link, &mut hit.snippet] {
            if field.contains('%') && field.contains("http") {
                *field = safe_unquote(field);
            }
        }
    }
}

/// Dataset/space listing pages on Hugging Face are rejected before any
/// network call is made.
pub fn is_hf_dataset_or_space_url(url: &str) -> bool {
    !url.is_empty()
        && (url.contains("huggingface.co/datasets") || url.contains("huggingface.co/spaces"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn reserved_sequences_are_untouched() {
        assert_eq!(
            safe_unquote("https://e.com/a%2Fb%3Fc%3Dd"),
            "https://e.com/a%2Fb%3Fc%3Dd"
        );
        // Case-insensitive on the hex digits.
        assert_eq!(safe_unquote("x%2fy"), "x%2fy");
    }

    #[test]
    fn safe_sequences_are_decoded() {
        assert_eq!(safe_unquote("caf%C3%A9"), "café");
        assert_eq!(safe_unquote("%48%49"), "HI");
    }

    #[test]
    fn consecutive_run_stops_at_reserved() {
        // %C3%A9 decodes as one unit; %2F stays.
        assert_eq!(safe_unquote("a%C3%A9%2Fb"), "aé%2Fb");
    }

    #[test]
    fn invalid_hex_passes_through() {
        assert_eq!(safe_unquote("100%zz"), "100%zz");
        assert_eq!(safe_unquote("100%"), "100%");
    }

    #[test]
    fn empty_string() {
        assert_eq!(safe_unquote(""), "");
    }

    #[test]
    fn hf_dataset_and_space_urls_detected() {
        assert!(is_hf_dataset_or_space_url(
            "https://huggingface.co/datasets/foo/bar"
        ));
        assert!(is_hf_dataset_or_space_url(
            "https://huggingface.co/spaces/foo/bar"
        ));
        assert!(!is_hf_dataset_or_space_url("https://huggingface.co/foo"));
        assert!(!is_hf_dataset_or_space_url(""));
    }

    #[test]
    fn decode_hit_urls_only_touches_encoded_http_strings() {
        let mut hits = vec![SearchHit {
            title: "50% off".to_string(),
            link: "https://e.com/%E4%B8%AD%E6%96%87".to_string(),
            snippet: "plain".to_string(),
        }];
        decode_hit_urls(&mut hits);
        assert_eq!(hits[0].title, "50% off");
        assert_eq!(hits[0].link, "https://e.com/中文");
        assert_eq!(hits[0].snippet, "plain");
    }

    proptest! {
        #[test]
        fn percent_free_strings_pass_through_unchanged(s in "[ -$&-~]{0,64}") {
            let once = safe_unquote(&s);
            prop_assert_eq!(&once, &s);
            prop_assert_eq!(safe_unquote(&once), s);
        }

        #[test]
        fn fully_decoded_output_is_a_fixed_point(s in "(%[46][0-9a-fA-F]|[a-z0-9/:.]){0,20}") {
            // Safe encodings of printable ASCII decode away entirely, so a
            // second application must be the identity.
            let once = safe_unquote(&s);
            prop_assert_eq!(safe_unquote(&once), once);
        }

        #[test]
        fn reserved_slash_survives_anywhere(prefix in "[a-z0-9/:.]{0,20}", suffix in "[a-z0-9/:.]{0,20}") {
            let s = format!("{prefix}%2F{suffix}");
            prop_assert!(safe_unquote(&s).contains("%2F"));
        }
    }
}
