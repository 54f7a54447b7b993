#![no_main]

use libfuzzer_sys::fuzz_target;

use imgshield::ssrf::{classify_literal, is_private_ip, validate_url};

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(target) = validate_url(input) {
        // An accepted target never carries a private literal
        if let Some(ip) = target.ip_literal() {
            assert!(!is_private_ip(ip), "accepted private literal {ip} from {input:?}");
        }
        assert!(matches!(target.scheme(), "http" | "https"));
        assert!(!target.host().is_empty());
    }

    if let Ok(private) = classify_literal(input) {
        if let Ok(ip) = input.trim_matches(|c| c == '[' || c == ']').parse() {
            assert_eq!(private, is_private_ip(ip));
        }
    }
});
