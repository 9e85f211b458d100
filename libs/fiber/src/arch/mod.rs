cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86_64", unix))] {
        mod x86_64;
        pub use x86_64::*;
    } else if #[cfg(all(target_arch = "aarch64", unix))] {
        mod aarch64;
        pub use aarch64::*;
    } else {
        compile_error!("unsupported target architecture");
    }
}
