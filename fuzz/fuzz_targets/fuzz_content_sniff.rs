#![no_main]

use libfuzzer_sys::fuzz_target;

use imgshield::media::content::sniff_signature;
use imgshield::media::{ImageFormat, SNIFF_LEN};

fuzz_target!(|data: &[u8]| {
    let prefix = &data[..data.len().min(SNIFF_LEN)];
    if let Ok(format) = sniff_signature(prefix) {
        let lead = match format {
            ImageFormat::Png => 0x89,
            ImageFormat::Jpeg => 0xFF,
            ImageFormat::Gif => b'G',
            ImageFormat::Webp => b'R',
        };
        assert_eq!(prefix[0], lead);
    }
});
