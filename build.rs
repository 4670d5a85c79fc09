// Limine needs no compiled-in header: the loader finds the kernel's
// requests (see `mm::boot`) by scanning the ELF for the `#[used]` statics
// rustc already emits, with no assembly entry stub or generated header
// required. Kept as a placeholder in case a future target needs a build-time
// step (e.g. templating a linker script).

fn main() {}
