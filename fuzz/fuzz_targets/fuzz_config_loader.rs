#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    // Parse and validation errors are fine; panics are not. A config that
    // validates must also resolve into a step table without panicking.
    if let Ok(cfg) = fluidics_config::load_toml(data)
        && cfg.validate().is_ok()
    {
        let _ = fluidics_core::StepBook::try_from(&cfg);
    }
});
