#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut vm = glyph_vm::Vm::with_output(
        data.to_vec(),
        glyph_vm::VmOptions::default(),
        std::io::sink(),
    );
    for _ in 0..10_000 {
        match vm.step() {
            Ok(true) | Err(_) => break,
            Ok(false) => {}
        }
    }
});
