#![no_main]
use libfuzzer_sys::fuzz_target;

// Parsing and validation may reject the input but must never panic.
fuzz_target!(|data: &str| {
    if let Ok(cfg) = vent_config::load_toml(data) {
        let _ = cfg.validate();
    }
});
