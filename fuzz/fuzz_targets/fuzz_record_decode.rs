#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Any 42-byte block decodes and re-encodes to the same bytes.
    if let Ok(record) = fluidics_core::ConfigRecord::decode(data) {
        assert_eq!(&record.encode()[..], data);
    }
});
