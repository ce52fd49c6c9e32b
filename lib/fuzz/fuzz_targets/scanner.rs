#![no_main]
use libfuzzer_sys::fuzz_target;

use docscan::{ScanConfig, Scanner};

fuzz_target!(|data: &[u8]| {
    let scanner = Scanner::new(ScanConfig::default());
    let result = scanner.scan(data);
    let _ = result.to_json();
});
